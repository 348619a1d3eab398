//! Entity boundary.
//!
//! The replication core never owns gameplay objects. It references them by an
//! opaque [`EntityHandle`] and reads their replicable state through the
//! [`EntitySource`] capability, which the gameplay model implements.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::math::{Rotator, Vec3};

/// Opaque, stable identifier of a networked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityHandle(pub u64);

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The replicable part of an entity: where it is, how it is turned and how big it is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityTransform {
    pub position: Vec3,
    pub rotation: Rotator,
    pub scale: Vec3,
}

impl Default for EntityTransform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Rotator::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl EntityTransform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Interpolates position, rotation and scale.
    pub fn lerp(self, to: Self, t: f32) -> Self {
        Self {
            position: self.position.lerp(to.position, t),
            rotation: self.rotation.lerp(to.rotation, t),
            scale: self.scale.lerp(to.scale, t),
        }
    }
}

/// Read access to the gameplay model.
///
/// `transform` returning `None` means the handle is no longer backed by a live
/// entity; the scheduler treats that as a stale registration.
pub trait EntitySource {
    fn transform(&self, handle: EntityHandle) -> Option<EntityTransform>;

    fn is_valid(&self, handle: EntityHandle) -> bool {
        self.transform(handle).is_some()
    }
}

impl<S: EntitySource + ?Sized> EntitySource for &S {
    fn transform(&self, handle: EntityHandle) -> Option<EntityTransform> {
        (**self).transform(handle)
    }

    fn is_valid(&self, handle: EntityHandle) -> bool {
        (**self).is_valid(handle)
    }
}
