//! Replica cache.
//!
//! The server sends discrete entity states whenever the scheduler accepts a
//! send. The client keeps the last two states per entity and interpolates
//! between them when rendering at its own rate.

use std::collections::HashMap;

use replication_shared::entity::{EntityHandle, EntityTransform};

#[derive(Debug, Clone, Copy)]
struct Replica {
    previous: Option<EntityTransform>,
    latest: EntityTransform,
    updates: u64,
}

/// Latest known state of every replicated entity.
#[derive(Debug, Default)]
pub struct ReplicaCache {
    entities: HashMap<EntityHandle, Replica>,
}

impl ReplicaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, entity: EntityHandle, state: EntityTransform) {
        self.entities
            .entry(entity)
            .and_modify(|r| {
                r.previous = Some(r.latest);
                r.latest = state;
                r.updates += 1;
            })
            .or_insert(Replica {
                previous: None,
                latest: state,
                updates: 1,
            });
    }

    pub fn forget(&mut self, entity: EntityHandle) -> bool {
        self.entities.remove(&entity).is_some()
    }

    /// Returns the number of known entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if nothing has been received yet.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn latest(&self, entity: EntityHandle) -> Option<EntityTransform> {
        self.entities.get(&entity).map(|r| r.latest)
    }

    pub fn updates(&self, entity: EntityHandle) -> u64 {
        self.entities.get(&entity).map_or(0, |r| r.updates)
    }

    /// Gets an interpolated state for an entity given a fractional alpha.
    ///
    /// `alpha` should be in $[0,1]$ where 0 = previous state, 1 = latest.
    /// With a single known state that state is returned as is.
    pub fn interpolate(&self, entity: EntityHandle, alpha: f32) -> Option<EntityTransform> {
        let r = self.entities.get(&entity)?;
        Some(match r.previous {
            Some(prev) => prev.lerp(r.latest, alpha),
            None => r.latest,
        })
    }

    /// Known handles in ascending order.
    pub fn handles(&self) -> Vec<EntityHandle> {
        let mut v: Vec<_> = self.entities.keys().copied().collect();
        v.sort();
        v
    }
}
