//! Replication registry.
//!
//! Owns the registered entity set and the per-entity scheduling metadata.
//! Iteration is deterministic: priority first (Critical → Low), then
//! registration order.
//!
//! Misuse (duplicate registration, unknown handle) is logged and ignored.
//! The boolean returns exist for callers that care; nothing is fatal.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{codec::StateBlock, entity::{EntityHandle, EntitySource}};

/// Processing order within a tick. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => anyhow::bail!("unknown priority '{other}'"),
        }
    }
}

/// How often an entity may be replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Never,
    Rarely,
    Occasionally,
    Frequently,
    Always,
}

impl Frequency {
    /// Minimum spacing between two sends. `None` means never due by time alone.
    pub fn interval(self) -> Option<Duration> {
        match self {
            Frequency::Never => None,
            Frequency::Rarely => Some(Duration::from_secs(5)),
            Frequency::Occasionally => Some(Duration::from_secs(1)),
            Frequency::Frequently => Some(Duration::from_millis(100)),
            Frequency::Always => Some(Duration::ZERO),
        }
    }
}

impl FromStr for Frequency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(Frequency::Never),
            "rarely" => Ok(Frequency::Rarely),
            "occasionally" => Ok(Frequency::Occasionally),
            "frequently" => Ok(Frequency::Frequently),
            "always" => Ok(Frequency::Always),
            other => anyhow::bail!("unknown frequency '{other}'"),
        }
    }
}

bitflags::bitflags! {
    /// Per-record scheduling flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// Never successfully sent yet.
        const NEEDS_INITIAL = 1 << 0;
        /// One-shot rate-limit bypass requested by a caller.
        const FORCE = 1 << 1;
    }
}

/// Scheduling metadata of one registered entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRecord {
    pub priority: Priority,
    pub frequency: Frequency,
    /// Time of the last accepted send; `None` until the first one.
    pub last_replication_time: Option<Duration>,
    pub flags: RecordFlags,
    /// Last snapshot that actually went out.
    pub last_known_state: Option<StateBlock>,
    registration_order: u64,
}

impl ReplicationRecord {
    fn new(priority: Priority, frequency: Frequency, registration_order: u64) -> Self {
        Self {
            priority,
            frequency,
            last_replication_time: None,
            flags: RecordFlags::NEEDS_INITIAL,
            last_known_state: None,
            registration_order,
        }
    }

    pub fn needs_initial_replication(&self) -> bool {
        self.flags.contains(RecordFlags::NEEDS_INITIAL)
    }

    pub fn force_replication(&self) -> bool {
        self.flags.contains(RecordFlags::FORCE)
    }

    pub fn registration_order(&self) -> u64 {
        self.registration_order
    }

    /// Whether the interval since the last accepted send has run out.
    pub fn interval_elapsed(&self, now: Duration) -> bool {
        match (self.frequency.interval(), self.last_replication_time) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now.saturating_sub(last) >= interval,
        }
    }

    /// `force ∨ needs_initial ∨ interval elapsed`.
    pub fn is_due(&self, now: Duration) -> bool {
        self.force_replication() || self.needs_initial_replication() || self.interval_elapsed(now)
    }

    fn order_key(&self) -> OrderKey {
        (self.priority, self.registration_order)
    }
}

type OrderKey = (Priority, u64);

#[derive(Debug, Default)]
pub struct ReplicationRegistry {
    records: HashMap<EntityHandle, ReplicationRecord>,
    order: BTreeMap<OrderKey, EntityHandle>,
    next_order: u64,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and changes nothing) if the handle is already registered.
    pub fn register(&mut self, handle: EntityHandle, priority: Priority, frequency: Frequency) -> bool {
        if self.records.contains_key(&handle) {
            warn!(entity = %handle, "Entity already registered for replication");
            return false;
        }
        let record = ReplicationRecord::new(priority, frequency, self.next_order);
        self.next_order += 1;
        self.order.insert(record.order_key(), handle);
        self.records.insert(handle, record);
        debug!(entity = %handle, ?priority, ?frequency, "Registered entity for replication");
        true
    }

    pub fn unregister(&mut self, handle: EntityHandle) -> bool {
        match self.records.remove(&handle) {
            Some(record) => {
                self.order.remove(&record.order_key());
                debug!(entity = %handle, "Unregistered entity from replication");
                true
            }
            None => {
                warn!(entity = %handle, "Cannot unregister unknown entity");
                false
            }
        }
    }

    pub fn is_registered(&self, handle: EntityHandle) -> bool {
        self.records.contains_key(&handle)
    }

    pub fn set_priority(&mut self, handle: EntityHandle, priority: Priority) -> bool {
        let Some(record) = self.records.get_mut(&handle) else {
            warn!(entity = %handle, "Cannot set priority of unknown entity");
            return false;
        };
        if record.priority != priority {
            self.order.remove(&record.order_key());
            record.priority = priority;
            self.order.insert(record.order_key(), handle);
        }
        true
    }

    pub fn set_frequency(&mut self, handle: EntityHandle, frequency: Frequency) -> bool {
        let Some(record) = self.records.get_mut(&handle) else {
            warn!(entity = %handle, "Cannot set frequency of unknown entity");
            return false;
        };
        record.frequency = frequency;
        true
    }

    /// Bypasses rate limiting for the next due-check.
    pub fn force_replicate(&mut self, handle: EntityHandle) -> bool {
        let Some(record) = self.records.get_mut(&handle) else {
            warn!(entity = %handle, "Cannot force replication of unknown entity");
            return false;
        };
        record.flags.insert(RecordFlags::FORCE);
        true
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&ReplicationRecord> {
        self.records.get(&handle)
    }

    pub(crate) fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut ReplicationRecord> {
        self.records.get_mut(&handle)
    }

    /// Records in priority order, ties by registration order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityHandle, &ReplicationRecord)> + '_ {
        self.order
            .values()
            .filter_map(move |h| self.records.get(h).map(|r| (*h, r)))
    }

    /// Handles in iteration order.
    pub fn handles(&self) -> Vec<EntityHandle> {
        self.order.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops every registration the source no longer considers valid.
    /// Returns the purged handles.
    pub fn retain_valid<S: EntitySource + ?Sized>(&mut self, source: &S) -> Vec<EntityHandle> {
        let stale: Vec<EntityHandle> = self
            .order
            .values()
            .copied()
            .filter(|h| !source.is_valid(*h))
            .collect();
        for handle in &stale {
            if let Some(record) = self.records.remove(handle) {
                self.order.remove(&record.order_key());
            }
            debug!(entity = %handle, "Purged stale replication handle");
        }
        stale
    }
}
