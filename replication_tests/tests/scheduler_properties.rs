//! Scheduling properties of the replication core, driven with explicit time.

use std::time::Duration;

use replication_shared::{
    codec::STATE_BLOCK_LEN,
    config::ReplicationConfig,
    entity::{EntityHandle, EntitySource, EntityTransform},
    math::{Rotator, Vec3},
    net::ClientId,
    registry::{Frequency, Priority},
    scheduler::{Outbox, ReplicationScheduler},
    world::SimWorld,
};

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn scheduler_with(cfg: ReplicationConfig) -> ReplicationScheduler {
    ReplicationScheduler::new(ReplicationConfig {
        server_update_rate: 10.0,
        ..cfg
    })
}

fn zero_transform() -> EntityTransform {
    EntityTransform {
        position: Vec3::ZERO,
        rotation: Rotator::ZERO,
        scale: Vec3::ZERO,
    }
}

#[test]
fn critical_always_entity_first_tick_sends_zero_block() {
    let mut world = SimWorld::new();
    let e1 = world.spawn(zero_transform());
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(e1, Priority::Critical, Frequency::Always);

    let mut out = Outbox::new();
    let outcome = s.tick(Duration::ZERO, &world, &mut out);

    assert_eq!(outcome.sent, 1);
    let packets = out.drain();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].entity, e1);
    assert_eq!(packets[0].payload.len(), STATE_BLOCK_LEN);
    assert!(packets[0].payload.iter().all(|b| *b == 0));
    assert!(!s.record(e1).unwrap().needs_initial_replication());
}

#[test]
fn every_new_entity_gets_exactly_one_initial_attempt() {
    let mut world = SimWorld::new();
    let mut s = scheduler_with(ReplicationConfig::default());
    let frequencies = [
        Frequency::Never,
        Frequency::Rarely,
        Frequency::Occasionally,
        Frequency::Frequently,
        Frequency::Always,
    ];
    let handles: Vec<_> = frequencies
        .iter()
        .map(|f| {
            let h = world.spawn(EntityTransform::default());
            s.register(h, Priority::Normal, *f);
            h
        })
        .collect();

    let mut out = Outbox::new();
    s.tick(Duration::ZERO, &world, &mut out);
    let mut sent: Vec<_> = out.drain().into_iter().map(|p| p.entity).collect();
    sent.sort();
    assert_eq!(sent, handles);

    // Nothing moved: only the 100 ms refresh of Frequently goes out.
    s.tick(ms(100), &world, &mut out);
    let resent: Vec<_> = out.drain().into_iter().map(|p| p.entity).collect();
    assert_eq!(resent, vec![handles[3]]);
}

#[test]
fn occasionally_entity_sends_once_per_second_while_idle() {
    let mut world = SimWorld::new();
    let e = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(e, Priority::Normal, Frequency::Occasionally);

    let mut out = Outbox::new();
    let mut sends_at = Vec::new();
    for step in 0..=30u64 {
        let now = ms(step * 100);
        if s.tick(now, &world, &mut out).sent > 0 {
            sends_at.push(now);
        }
    }

    assert_eq!(sends_at, vec![ms(0), ms(1000), ms(2000), ms(3000)]);
}

#[test]
fn occasionally_entity_is_rate_limited_while_moving() {
    let mut world = SimWorld::new();
    let e = world.spawn(EntityTransform::default());
    world.set_velocity(e, Vec3::new(1.0, 0.0, 0.0));
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(e, Priority::Normal, Frequency::Occasionally);

    let mut out = Outbox::new();
    let mut sent = 0;
    for step in 0..20u64 {
        world.step(0.1);
        sent += s.tick(ms(step * 100), &world, &mut out).sent;
    }
    // t = 0.0 and t = 1.0
    assert_eq!(sent, 2);
}

#[test]
fn forced_unchanged_entities_send_once_then_go_idle() {
    let mut world = SimWorld::new();
    let never = world.spawn(EntityTransform::default());
    let occasionally = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(never, Priority::Normal, Frequency::Never);
    s.register(occasionally, Priority::Normal, Frequency::Occasionally);

    let mut out = Outbox::new();
    assert_eq!(s.tick(ms(0), &world, &mut out).sent, 2);
    out.drain();
    assert_eq!(s.tick(ms(100), &world, &mut out).due, 0);

    // Inside the Occasionally interval and with nothing moved.
    assert!(s.force_replicate(never));
    assert!(s.force_replicate(occasionally));
    let forced = s.tick(ms(200), &world, &mut out);
    assert_eq!((forced.due, forced.sent), (2, 2));
    let mut sent: Vec<_> = out.drain().into_iter().map(|p| p.entity).collect();
    sent.sort();
    assert_eq!(sent, vec![never, occasionally]);
    for h in [never, occasionally] {
        let record = s.record(h).unwrap();
        assert!(!record.force_replication());
        assert_eq!(record.last_replication_time, Some(ms(200)));
    }

    // Idle until the Occasionally interval runs out again at 1.2 s.
    for step in 3..12u64 {
        assert_eq!(s.tick(ms(step * 100), &world, &mut out).sent, 0);
    }
    assert!(out.is_empty());
    let refresh = s.tick(ms(1200), &world, &mut out);
    assert_eq!(refresh.sent, 1);
    assert_eq!(out.drain()[0].entity, occasionally);
}

#[test]
fn budget_rejection_leaves_record_untouched() {
    let mut world = SimWorld::new();
    let e = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig {
        max_bytes_per_window: 10,
        ..Default::default()
    });
    s.register(e, Priority::Normal, Frequency::Always);

    let mut out = Outbox::new();
    let outcome = s.tick(Duration::ZERO, &world, &mut out);
    assert_eq!(outcome.rejected, 1);
    assert!(out.is_empty());

    let record = s.record(e).unwrap();
    assert!(record.last_known_state.is_none());
    assert!(record.last_replication_time.is_none());
    assert!(record.needs_initial_replication());
    assert_eq!(s.statistics().budget_rejections, 1);
    assert_eq!(s.statistics().bytes_written, 0);
}

#[test]
fn repeated_rejections_leave_a_fresh_record() {
    let mut world = SimWorld::new();
    let e = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig {
        max_bytes_per_window: 10,
        ..Default::default()
    });
    s.register(e, Priority::Normal, Frequency::Never);
    let fresh = s.record(e).cloned().unwrap();

    let mut out = Outbox::new();
    for step in 0..3u64 {
        assert_eq!(s.tick(ms(step * 100), &world, &mut out).rejected, 1);
    }
    assert!(out.is_empty());
    assert_eq!(s.statistics().budget_rejections, 3);
    assert_eq!(s.record(e), Some(&fresh));
}

#[test]
fn exhausted_budget_stays_exhausted_until_reset() {
    let mut world = SimWorld::new();
    let a = world.spawn(EntityTransform::default());
    let b = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig {
        max_bytes_per_window: STATE_BLOCK_LEN as u64,
        ..Default::default()
    });
    s.register(a, Priority::High, Frequency::Always);
    s.register(b, Priority::Low, Frequency::Always);

    let mut out = Outbox::new();
    let first = s.tick(Duration::ZERO, &world, &mut out);
    assert_eq!((first.sent, first.rejected), (1, 1));
    assert_eq!(out.drain()[0].entity, a);

    // Much later, still no room.
    let later = s.tick(Duration::from_secs(60), &world, &mut out);
    assert_eq!(later.rejected, 1);
    assert!(s.record(b).unwrap().needs_initial_replication());

    s.reset_bandwidth();
    let after_reset = s.tick(Duration::from_secs(61), &world, &mut out);
    assert_eq!(after_reset.sent, 1);
    assert_eq!(out.drain()[0].entity, b);
}

#[test]
fn iteration_follows_priority_not_registration() {
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(EntityHandle(1), Priority::Low, Frequency::Always);
    s.register(EntityHandle(2), Priority::Critical, Frequency::Always);
    s.register(EntityHandle(3), Priority::Normal, Frequency::Always);

    let order: Vec<_> = s.registry().iter().map(|(_, r)| r.priority).collect();
    assert_eq!(order, vec![Priority::Critical, Priority::Normal, Priority::Low]);
}

#[test]
fn sends_go_out_in_priority_order() {
    let mut world = SimWorld::new();
    let low = world.spawn(EntityTransform::default());
    let critical = world.spawn(EntityTransform::default());
    let normal = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(low, Priority::Low, Frequency::Always);
    s.register(critical, Priority::Critical, Frequency::Always);
    s.register(normal, Priority::Normal, Frequency::Always);

    let mut out = Outbox::new();
    s.tick(Duration::ZERO, &world, &mut out);
    let order: Vec<_> = out.iter().map(|p| p.entity).collect();
    assert_eq!(order, vec![critical, normal, low]);
}

#[test]
fn far_client_excludes_entity_unless_overridden() {
    let mut world = SimWorld::new();
    let e = world.spawn(EntityTransform::at(Vec3::ZERO));
    let near = ClientId(1);
    let far = ClientId(2);

    let mut s = scheduler_with(ReplicationConfig {
        relevance_distance: 100.0,
        ..Default::default()
    });
    s.register(e, Priority::Normal, Frequency::Always);
    s.upsert_client(near, Some(Vec3::new(50.0, 0.0, 0.0)));
    s.upsert_client(far, Some(Vec3::new(5000.0, 0.0, 0.0)));

    assert_eq!(s.relevant_entities(near, &world), vec![e]);
    assert!(s.relevant_entities(far, &world).is_empty());

    let mut overridden = scheduler_with(ReplicationConfig {
        relevance_distance: 100.0,
        always_relevant_overrides: vec![e],
        ..Default::default()
    });
    overridden.register(e, Priority::Normal, Frequency::Always);
    overridden.upsert_client(far, Some(Vec3::new(5000.0, 0.0, 0.0)));
    assert_eq!(overridden.relevant_entities(far, &world), vec![e]);
}

#[test]
fn relevance_is_pure_within_a_tick() {
    let mut world = SimWorld::new();
    let e = world.spawn(EntityTransform::at(Vec3::new(10.0, 0.0, 0.0)));
    let mut s = scheduler_with(ReplicationConfig {
        relevance_distance: 20.0,
        ..Default::default()
    });
    s.register(e, Priority::Normal, Frequency::Always);
    s.upsert_client(ClientId(1), Some(Vec3::ZERO));
    s.upsert_client(ClientId(2), None);

    let first = (s.is_relevant(e, ClientId(1), &world), s.is_relevant(e, ClientId(2), &world));
    let second = (s.is_relevant(e, ClientId(2), &world), s.is_relevant(e, ClientId(1), &world));
    assert_eq!(first, (true, false));
    assert_eq!(second, (false, true));
}

#[test]
fn despawned_entities_are_swept_by_optimize() {
    let mut world = SimWorld::new();
    let a = world.spawn(EntityTransform::default());
    let b = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(a, Priority::Normal, Frequency::Rarely);
    s.register(b, Priority::Normal, Frequency::Rarely);

    world.despawn(a);
    assert!(!world.is_valid(a));
    assert_eq!(s.optimize(&world), vec![a]);
    assert!(!s.is_registered(a));
    assert!(s.is_registered(b));
}

#[test]
fn statistics_accumulate_across_ticks() {
    let mut world = SimWorld::new();
    let e = world.spawn(EntityTransform::default());
    let mut s = scheduler_with(ReplicationConfig::default());
    s.register(e, Priority::Normal, Frequency::Always);

    let mut out = Outbox::new();
    for step in 0..5u64 {
        world.set_position(e, Vec3::new(step as f32, 0.0, 0.0));
        s.tick(ms(step * 100), &world, &mut out);
    }

    let stats = s.statistics();
    assert_eq!(stats.total_entities_replicated, 5);
    assert_eq!(stats.packets_sent, 5);
    assert_eq!(stats.bytes_written, 5 * STATE_BLOCK_LEN as u64);
    assert_eq!(stats.ticks_processed, 5);
    assert!((stats.average_compression_ratio - 1.0).abs() < 1e-9);
}
