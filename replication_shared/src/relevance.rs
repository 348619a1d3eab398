//! Relevance policy.
//!
//! Decides whether an entity is of interest to a client: explicit
//! always-relevant override first, then a sphere-distance test around the
//! client's anchor. Relevance gates distribution only; one computed snapshot
//! may be forwarded to several clients.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{entity::EntityHandle, math::Vec3, net::ClientId};

/// What the scheduler knows about a client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientView {
    pub id: ClientId,
    /// `None` until the client has something to stand on (not yet spawned).
    pub anchor: Option<Vec3>,
}

impl ClientView {
    pub fn new(id: ClientId, anchor: Option<Vec3>) -> Self {
        Self { id, anchor }
    }
}

#[derive(Debug, Clone)]
pub struct RelevancePolicy {
    relevance_distance: f32,
    always_relevant: HashSet<EntityHandle>,
}

impl RelevancePolicy {
    pub fn new(relevance_distance: f32, always_relevant: impl IntoIterator<Item = EntityHandle>) -> Self {
        Self {
            relevance_distance: sanitize_distance(relevance_distance),
            always_relevant: always_relevant.into_iter().collect(),
        }
    }

    pub fn relevance_distance(&self) -> f32 {
        self.relevance_distance
    }

    pub fn set_relevance_distance(&mut self, distance: f32) {
        self.relevance_distance = sanitize_distance(distance);
    }

    /// Returns true if the handle was not already overridden.
    pub fn add_always_relevant(&mut self, entity: EntityHandle) -> bool {
        self.always_relevant.insert(entity)
    }

    pub fn remove_always_relevant(&mut self, entity: EntityHandle) -> bool {
        self.always_relevant.remove(&entity)
    }

    pub fn is_always_relevant(&self, entity: EntityHandle) -> bool {
        self.always_relevant.contains(&entity)
    }

    pub fn is_relevant(&self, entity: EntityHandle, entity_position: Vec3, client: &ClientView) -> bool {
        if self.always_relevant.contains(&entity) {
            return true;
        }
        let Some(anchor) = client.anchor else {
            return false;
        };
        entity_position.distance_sq(anchor) <= self.relevance_distance * self.relevance_distance
    }

    /// Clients (in the given order) to which the entity should be forwarded.
    pub fn relevant_clients<'a>(
        &self,
        entity: EntityHandle,
        entity_position: Vec3,
        clients: impl IntoIterator<Item = &'a ClientView>,
    ) -> Vec<ClientId> {
        clients
            .into_iter()
            .filter(|c| self.is_relevant(entity, entity_position, c))
            .map(|c| c.id)
            .collect()
    }
}

/// Negative or NaN distances collapse to zero: only co-located entities pass.
fn sanitize_distance(distance: f32) -> f32 {
    if distance.is_nan() {
        0.0
    } else {
        distance.max(0.0)
    }
}

impl Default for RelevancePolicy {
    fn default() -> Self {
        Self::new(50_000.0, [])
    }
}
