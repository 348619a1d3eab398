//! Replication scheduler.
//!
//! Once per server tick the scheduler walks the registry in priority order,
//! picks the entities that are due, captures their state, decides whether the
//! state is worth sending, charges the bandwidth budget and hands accepted
//! payloads to the transport boundary together with the clients they are
//! relevant to.
//!
//! Time is always supplied by the caller as a monotonic offset since session
//! start; nothing here samples a clock to make scheduling decisions.
//!
//! Per-record contract:
//! - `FORCE` is consumed by the due-check that saw it, whether or not the
//!   send is accepted.
//! - `NEEDS_INITIAL`, `last_known_state` and `last_replication_time` change
//!   only on a budget-accepted send. A rejected attempt leaves them exactly as
//!   they were, so the next tick retries as if nothing happened.
//! - A due entity whose state is unchanged is skipped without touching its
//!   timestamps, so it keeps being re-evaluated every tick.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::{
    change::ChangeDetector,
    codec::{EntityStateCodec, FrameFlags, ReplicationFrame, STATE_BLOCK_LEN},
    config::ReplicationConfig,
    entity::{EntityHandle, EntitySource},
    math::Vec3,
    net::ClientId,
    registry::{Frequency, Priority, RecordFlags, ReplicationRecord, ReplicationRegistry},
    relevance::{ClientView, RelevancePolicy},
    stats::ReplicationStatistics,
    throttle::BandwidthThrottle,
};

/// One accepted send, as handed to the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReplication {
    pub entity: EntityHandle,
    /// Transformed state block.
    pub payload: Bytes,
    pub flags: FrameFlags,
    /// Clients the payload should be forwarded to, in client id order.
    pub relevant_clients: Vec<ClientId>,
}

impl OutboundReplication {
    pub fn to_frame(&self) -> ReplicationFrame {
        ReplicationFrame::new(self.entity, self.flags, self.payload.clone())
    }
}

/// Transport boundary. Accepting a packet means "took the bytes for delivery";
/// ordering and retransmission are the transport's business.
pub trait ReplicationSink {
    fn submit(&mut self, packet: OutboundReplication);
}

impl ReplicationSink for Vec<OutboundReplication> {
    fn submit(&mut self, packet: OutboundReplication) {
        self.push(packet);
    }
}

/// Buffers accepted packets until the host flushes them.
#[derive(Debug, Default)]
pub struct Outbox {
    packets: Vec<OutboundReplication>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundReplication> {
        self.packets.iter()
    }

    pub fn drain(&mut self) -> Vec<OutboundReplication> {
        std::mem::take(&mut self.packets)
    }
}

impl ReplicationSink for Outbox {
    fn submit(&mut self, packet: OutboundReplication) {
        self.packets.push(packet);
    }
}

/// Summary of one `tick` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// False when the tick gate swallowed the call.
    pub ran: bool,
    pub due: usize,
    pub sent: usize,
    pub unchanged: usize,
    pub rejected: usize,
    /// Handles dropped because the gameplay model no longer backs them.
    pub purged: Vec<EntityHandle>,
}

enum EntityOutcome {
    Sent,
    Unchanged,
    Rejected,
    Stale,
}

#[derive(Debug)]
pub struct ReplicationScheduler {
    config: ReplicationConfig,
    registry: ReplicationRegistry,
    codec: EntityStateCodec,
    detector: ChangeDetector,
    policy: RelevancePolicy,
    throttle: BandwidthThrottle,
    stats: ReplicationStatistics,
    clients: BTreeMap<ClientId, ClientView>,
    tick_interval: Duration,
    last_tick: Option<Duration>,
}

impl ReplicationScheduler {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            registry: ReplicationRegistry::new(),
            codec: EntityStateCodec::new(config.compression_enabled, config.encryption_enabled),
            detector: ChangeDetector::new(config.change_tolerance),
            policy: RelevancePolicy::new(
                config.relevance_distance,
                config.always_relevant_overrides.iter().copied(),
            ),
            throttle: BandwidthThrottle::new(config.max_bytes_per_window),
            stats: ReplicationStatistics::default(),
            clients: BTreeMap::new(),
            tick_interval: config.server_tick_interval(),
            last_tick: None,
            config,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    // ─── Registry façade ───

    pub fn register(&mut self, handle: EntityHandle, priority: Priority, frequency: Frequency) -> bool {
        self.registry.register(handle, priority, frequency)
    }

    pub fn unregister(&mut self, handle: EntityHandle) -> bool {
        self.registry.unregister(handle)
    }

    pub fn is_registered(&self, handle: EntityHandle) -> bool {
        self.registry.is_registered(handle)
    }

    pub fn set_priority(&mut self, handle: EntityHandle, priority: Priority) -> bool {
        self.registry.set_priority(handle, priority)
    }

    pub fn set_frequency(&mut self, handle: EntityHandle, frequency: Frequency) -> bool {
        self.registry.set_frequency(handle, frequency)
    }

    pub fn force_replicate(&mut self, handle: EntityHandle) -> bool {
        self.registry.force_replicate(handle)
    }

    pub fn record(&self, handle: EntityHandle) -> Option<&ReplicationRecord> {
        self.registry.get(handle)
    }

    pub fn registry(&self) -> &ReplicationRegistry {
        &self.registry
    }

    // ─── Collaborators ───

    pub fn policy(&self) -> &RelevancePolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut RelevancePolicy {
        &mut self.policy
    }

    pub fn codec(&self) -> &EntityStateCodec {
        &self.codec
    }

    /// Lets the host install real compression/encryption transforms.
    pub fn codec_mut(&mut self) -> &mut EntityStateCodec {
        &mut self.codec
    }

    pub fn throttle(&self) -> &BandwidthThrottle {
        &self.throttle
    }

    /// The only way the bandwidth window is cleared.
    pub fn reset_bandwidth(&mut self) {
        debug!(spent = self.throttle.spent(), "Bandwidth window reset");
        self.throttle.reset();
    }

    pub fn statistics(&self) -> &ReplicationStatistics {
        &self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    // ─── Clients ───

    /// Adds a client or replaces its anchor.
    pub fn upsert_client(&mut self, id: ClientId, anchor: Option<Vec3>) {
        self.clients.insert(id, ClientView::new(id, anchor));
    }

    pub fn set_client_anchor(&mut self, id: ClientId, anchor: Option<Vec3>) -> bool {
        match self.clients.get_mut(&id) {
            Some(view) => {
                view.anchor = anchor;
                true
            }
            None => {
                warn!(client_id = ?id, "Cannot set anchor of unknown client");
                false
            }
        }
    }

    pub fn remove_client(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientView> {
        self.clients.get(&id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientView> {
        self.clients.values()
    }

    // ─── Relevance queries ───

    /// Returns false for unknown clients or entities without readable state.
    pub fn is_relevant<S: EntitySource + ?Sized>(
        &self,
        entity: EntityHandle,
        client: ClientId,
        source: &S,
    ) -> bool {
        let Some(view) = self.clients.get(&client) else {
            return false;
        };
        source
            .transform(entity)
            .is_some_and(|t| self.policy.is_relevant(entity, t.position, view))
    }

    /// Registered entities relevant to `client`, in registry order.
    pub fn relevant_entities<S: EntitySource + ?Sized>(&self, client: ClientId, source: &S) -> Vec<EntityHandle> {
        let Some(view) = self.clients.get(&client) else {
            warn!(client_id = ?client, "Relevance query for unknown client");
            return Vec::new();
        };
        self.relevant_entities_for(view, source)
    }

    pub fn relevant_entities_for<S: EntitySource + ?Sized>(&self, view: &ClientView, source: &S) -> Vec<EntityHandle> {
        self.registry
            .iter()
            .filter_map(|(handle, _)| {
                let t = source.transform(handle)?;
                self.policy
                    .is_relevant(handle, t.position, view)
                    .then_some(handle)
            })
            .collect()
    }

    // ─── Tick ───

    /// Runs one scheduling pass if the tick interval has elapsed since the
    /// last one that ran. Safe to poll more often than the configured rate.
    pub fn tick<S, K>(&mut self, now: Duration, source: &S, sink: &mut K) -> TickOutcome
    where
        S: EntitySource + ?Sized,
        K: ReplicationSink + ?Sized,
    {
        if let Some(last) = self.last_tick {
            if now.saturating_sub(last) < self.tick_interval {
                return TickOutcome::default();
            }
        }
        self.last_tick = Some(now);

        let started = Instant::now();
        self.stats.begin_tick();

        if self.registry.len() > self.config.max_entities_per_tick {
            debug!(
                registered = self.registry.len(),
                soft_cap = self.config.max_entities_per_tick,
                "Registered entities exceed per-tick soft cap"
            );
        }

        let mut outcome = TickOutcome {
            ran: true,
            ..Default::default()
        };

        for handle in self.registry.handles() {
            let due = self
                .registry
                .get(handle)
                .is_some_and(|record| record.is_due(now));
            if !due {
                continue;
            }
            outcome.due += 1;

            match self.process_entity(handle, now, source, sink) {
                EntityOutcome::Sent => outcome.sent += 1,
                EntityOutcome::Unchanged => outcome.unchanged += 1,
                EntityOutcome::Rejected => outcome.rejected += 1,
                EntityOutcome::Stale => outcome.purged.push(handle),
            }
        }

        for handle in &outcome.purged {
            debug!(entity = %handle, "Entity vanished between ticks, dropping registration");
            self.registry.unregister(*handle);
        }

        self.stats.end_tick(started.elapsed());
        trace!(
            due = outcome.due,
            sent = outcome.sent,
            unchanged = outcome.unchanged,
            rejected = outcome.rejected,
            "Replication tick"
        );
        outcome
    }

    fn process_entity<S, K>(
        &mut self,
        handle: EntityHandle,
        now: Duration,
        source: &S,
        sink: &mut K,
    ) -> EntityOutcome
    where
        S: EntitySource + ?Sized,
        K: ReplicationSink + ?Sized,
    {
        let Some(transform) = source.transform(handle) else {
            return EntityOutcome::Stale;
        };
        let Some(record) = self.registry.get_mut(handle) else {
            return EntityOutcome::Stale;
        };

        let forced = record.force_replication();
        let initial = record.needs_initial_replication();
        record.flags.remove(RecordFlags::FORCE);

        let snapshot = EntityStateCodec::capture(&transform);
        let changed = self
            .detector
            .differs(&snapshot, record.last_known_state.as_ref());
        // Time-limited frequencies also refresh unchanged state once per interval.
        let refresh = record.frequency.interval().is_some_and(|i| !i.is_zero())
            && record.interval_elapsed(now);

        if !(forced || initial || changed || refresh) {
            return EntityOutcome::Unchanged;
        }

        let payload = self.codec.encode_payload(&snapshot);
        if !self.throttle.try_reserve(payload.len()) {
            self.stats.record_rejection();
            debug!(
                entity = %handle,
                bytes = payload.len(),
                remaining = self.throttle.remaining(),
                "Bandwidth budget exhausted, deferring send"
            );
            return EntityOutcome::Rejected;
        }

        let relevant_clients =
            self.policy
                .relevant_clients(handle, transform.position, self.clients.values());
        let payload_len = payload.len();
        sink.submit(OutboundReplication {
            entity: handle,
            payload,
            flags: self.codec.flags(),
            relevant_clients,
        });

        record.last_known_state = Some(snapshot);
        record.last_replication_time = Some(now);
        record.flags.remove(RecordFlags::NEEDS_INITIAL);
        self.stats.record_send(STATE_BLOCK_LEN, payload_len);

        trace!(entity = %handle, bytes = payload_len, forced, initial, "Replicated entity");
        EntityOutcome::Sent
    }

    /// Periodic sweep: drops registrations the gameplay model reports as dead.
    pub fn optimize<S: EntitySource + ?Sized>(&mut self, source: &S) -> Vec<EntityHandle> {
        let purged = self.registry.retain_valid(source);
        if !purged.is_empty() {
            info!(purged = purged.len(), remaining = self.registry.len(), "Purged stale replication handles");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entity::EntityTransform, world::SimWorld};

    fn scheduler(cfg: ReplicationConfig) -> ReplicationScheduler {
        ReplicationScheduler::new(ReplicationConfig {
            server_update_rate: 10.0,
            ..cfg
        })
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn tick_gate_swallows_early_calls() {
        let mut world = SimWorld::new();
        let e = world.spawn(EntityTransform::default());
        let mut s = scheduler(ReplicationConfig::default());
        s.register(e, Priority::Normal, Frequency::Always);

        let mut out = Outbox::new();
        assert!(s.tick(ms(0), &world, &mut out).ran);
        let gated = s.tick(ms(50), &world, &mut out);
        assert!(!gated.ran);
        assert_eq!(s.statistics().ticks_processed, 1);
        assert!(s.tick(ms(100), &world, &mut out).ran);
    }

    #[test]
    fn gated_tick_keeps_per_tick_counter() {
        let mut world = SimWorld::new();
        let e = world.spawn(EntityTransform::default());
        let mut s = scheduler(ReplicationConfig::default());
        s.register(e, Priority::Normal, Frequency::Always);

        let mut out = Outbox::new();
        s.tick(ms(0), &world, &mut out);
        assert_eq!(s.statistics().entities_replicated_this_tick, 1);
        s.tick(ms(10), &world, &mut out);
        assert_eq!(s.statistics().entities_replicated_this_tick, 1);
        s.tick(ms(100), &world, &mut out);
        assert_eq!(s.statistics().entities_replicated_this_tick, 0);
    }

    #[test]
    fn unchanged_always_entity_is_skipped_without_touching_timestamp() {
        let mut world = SimWorld::new();
        let e = world.spawn(EntityTransform::default());
        let mut s = scheduler(ReplicationConfig::default());
        s.register(e, Priority::Normal, Frequency::Always);

        let mut out = Outbox::new();
        s.tick(ms(0), &world, &mut out);
        let second = s.tick(ms(100), &world, &mut out);
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.sent, 0);
        assert_eq!(s.record(e).unwrap().last_replication_time, Some(ms(0)));

        world.set_position(e, Vec3::new(1.0, 0.0, 0.0));
        let third = s.tick(ms(200), &world, &mut out);
        assert_eq!(third.sent, 1);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn forced_send_consumes_flag_even_when_rejected() {
        let mut world = SimWorld::new();
        let e = world.spawn(EntityTransform::default());
        let mut s = scheduler(ReplicationConfig {
            max_bytes_per_window: 36,
            ..Default::default()
        });
        s.register(e, Priority::Normal, Frequency::Never);

        let mut out = Outbox::new();
        assert_eq!(s.tick(ms(0), &world, &mut out).sent, 1);

        s.force_replicate(e);
        let rejected = s.tick(ms(100), &world, &mut out);
        assert_eq!(rejected.rejected, 1);
        assert!(!s.record(e).unwrap().force_replication());

        s.reset_bandwidth();
        let idle = s.tick(ms(200), &world, &mut out);
        assert_eq!(idle.due, 0);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn stale_handle_is_purged_lazily() {
        let mut world = SimWorld::new();
        let keep = world.spawn(EntityTransform::default());
        let gone = world.spawn(EntityTransform::default());
        let mut s = scheduler(ReplicationConfig::default());
        s.register(keep, Priority::Normal, Frequency::Always);
        s.register(gone, Priority::Normal, Frequency::Always);
        world.despawn(gone);

        let mut out = Outbox::new();
        let outcome = s.tick(ms(0), &world, &mut out);
        assert_eq!(outcome.purged, vec![gone]);
        assert!(!s.is_registered(gone));
        assert!(s.is_registered(keep));
    }

    #[test]
    fn accepted_packet_lists_relevant_clients() {
        let mut world = SimWorld::new();
        let e = world.spawn(EntityTransform::at(Vec3::new(5.0, 0.0, 0.0)));
        let mut s = scheduler(ReplicationConfig {
            relevance_distance: 10.0,
            ..Default::default()
        });
        s.register(e, Priority::High, Frequency::Always);
        s.upsert_client(ClientId(2), Some(Vec3::new(500.0, 0.0, 0.0)));
        s.upsert_client(ClientId(1), Some(Vec3::ZERO));
        s.upsert_client(ClientId(3), None);

        let mut out = Vec::new();
        s.tick(ms(0), &world, &mut out);
        assert_eq!(out[0].relevant_clients, vec![ClientId(1)]);
        assert_eq!(out[0].payload.len(), STATE_BLOCK_LEN);
    }
}
