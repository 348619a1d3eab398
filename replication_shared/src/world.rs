//! In-memory simulation world.
//!
//! A deliberately small stand-in for the gameplay model: entities are plain
//! transforms with an optional linear velocity. It exists so hosts and tests
//! have something that implements [`EntitySource`].

use std::collections::HashMap;

use crate::{
    entity::{EntityHandle, EntitySource, EntityTransform},
    math::Vec3,
};

#[derive(Debug, Clone, Copy, Default)]
struct Body {
    transform: EntityTransform,
    velocity: Vec3,
}

/// Simple world keyed by entity handle.
#[derive(Debug, Default)]
pub struct SimWorld {
    next_id: u64,
    bodies: HashMap<EntityHandle, Body>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            bodies: HashMap::new(),
        }
    }

    /// Creates a new entity.
    pub fn spawn(&mut self, transform: EntityTransform) -> EntityHandle {
        let id = EntityHandle(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.bodies.insert(
            id,
            Body {
                transform,
                velocity: Vec3::ZERO,
            },
        );
        id
    }

    pub fn despawn(&mut self, entity: EntityHandle) -> bool {
        self.bodies.remove(&entity).is_some()
    }

    pub fn contains(&self, entity: EntityHandle) -> bool {
        self.bodies.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn set_transform(&mut self, entity: EntityHandle, transform: EntityTransform) -> bool {
        self.bodies
            .get_mut(&entity)
            .map(|b| b.transform = transform)
            .is_some()
    }

    pub fn set_position(&mut self, entity: EntityHandle, position: Vec3) -> bool {
        self.bodies
            .get_mut(&entity)
            .map(|b| b.transform.position = position)
            .is_some()
    }

    pub fn set_velocity(&mut self, entity: EntityHandle, velocity: Vec3) -> bool {
        self.bodies
            .get_mut(&entity)
            .map(|b| b.velocity = velocity)
            .is_some()
    }

    /// Advances every body by its velocity.
    pub fn step(&mut self, dt_sec: f32) {
        for body in self.bodies.values_mut() {
            body.transform.position = body.transform.position.offset(body.velocity.scaled(dt_sec));
        }
    }

    /// Handles in ascending order.
    pub fn handles(&self) -> Vec<EntityHandle> {
        let mut handles: Vec<_> = self.bodies.keys().copied().collect();
        handles.sort();
        handles
    }
}

impl EntitySource for SimWorld {
    fn transform(&self, handle: EntityHandle) -> Option<EntityTransform> {
        self.bodies.get(&handle).map(|b| b.transform)
    }

    fn is_valid(&self, handle: EntityHandle) -> bool {
        self.bodies.contains_key(&handle)
    }
}
