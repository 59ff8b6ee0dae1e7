//! End-to-end collector behaviour: registration lifecycle, replay/live
//! hand-off, ordering, eviction.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use herald::{
    ChannelTarget, CollectorConfig, DeliveryError, DeliveryTarget, DurableCollector, Event, EventDescriptor,
    EventId, EventStream, FnTarget, GrantDuration, GrantToken, ManualClock,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn event(seq: u64) -> Event {
    Event::new(
        &EventDescriptor::new("plant.temperature", 7),
        seq,
        at(i64::try_from(seq).unwrap()),
        serde_json::json!({ "reading": seq }),
    )
}

fn seqs(events: &[Event]) -> Vec<u64> {
    events.iter().map(|e| e.sequence).collect()
}

fn wait_until_live(collector: &DurableCollector, token: GrantToken) {
    for _ in 0..400 {
        if collector.registration_info(token).is_some_and(|i| !i.replaying) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("registration {token} never left replay");
}

fn attach(collector: &DurableCollector, token: GrantToken) -> EventStream {
    let (target, stream) = ChannelTarget::unbounded();
    collector.enable_delivery(token, Arc::new(target)).unwrap();
    stream
}

#[test]
fn test_end_to_end_scenario() {
    let collector = DurableCollector::open(CollectorConfig::default()).unwrap();
    let grant = collector.register(GrantDuration::secs(60)).unwrap();

    for seq in 1..=3 {
        collector.ingest(event(seq)).unwrap();
    }
    collector.drain().unwrap();

    let stream_a = attach(&collector, grant.token);
    let received = stream_a.collect(3, Duration::from_secs(2));
    assert_eq!(seqs(&received), vec![1, 2, 3]);
    wait_until_live(&collector, grant.token);

    collector.disable_delivery(grant.token).unwrap();
    collector.ingest(event(4)).unwrap();
    collector.ingest(event(5)).unwrap();
    collector.drain().unwrap();

    let stream_b = attach(&collector, grant.token);
    let received = stream_b.collect(2, Duration::from_secs(2));
    assert_eq!(seqs(&received), vec![4, 5]);
    wait_until_live(&collector, grant.token);

    assert!(stream_a.drain().is_empty());
    assert!(stream_b.drain().is_empty());
}

#[test]
fn test_handoff_has_no_gap_and_no_duplicate_under_load() {
    let collector = Arc::new(DurableCollector::open(CollectorConfig::default()).unwrap());
    let grant = collector.register(GrantDuration::secs(60)).unwrap();

    for seq in 0..200 {
        collector.notify(event(seq));
    }

    let feeder = {
        let collector = Arc::clone(&collector);
        thread::spawn(move || {
            for seq in 200..400 {
                collector.ingest(event(seq)).unwrap();
            }
        })
    };
    let stream = attach(&collector, grant.token);
    feeder.join().unwrap();
    collector.drain().unwrap();
    wait_until_live(&collector, grant.token);

    let received = seqs(&stream.drain());
    assert_eq!(received, (0..400).collect::<Vec<_>>());
}

#[test]
fn test_reattach_during_replay_replaces_target() {
    let collector = DurableCollector::open(CollectorConfig::default()).unwrap();
    let grant = collector.register(GrantDuration::secs(60)).unwrap();
    for seq in 1..=3 {
        collector.notify(event(seq));
    }

    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
    let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
    let (first, first_stream) = ChannelTarget::unbounded();
    let slow = FnTarget(move |e: &Event| -> Result<(), DeliveryError> {
        let _ = started_tx.try_send(());
        let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        first.deliver(e)
    });
    collector.enable_delivery(grant.token, Arc::new(slow)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let (second, second_stream) = ChannelTarget::unbounded();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let _ = gate_tx.send(());
    });
    // Blocks until the in-flight delivery of the first event returns.
    collector.enable_delivery(grant.token, Arc::new(second)).unwrap();
    releaser.join().unwrap();
    wait_until_live(&collector, grant.token);

    let first = seqs(&first_stream.drain());
    let mut all = first.clone();
    all.extend(seqs(&second_stream.drain()));
    assert_eq!(first[0], 1);
    assert_eq!(all, vec![1, 2, 3]);
}

#[test]
fn test_deletion_is_identity_based_and_idempotent() {
    let collector = DurableCollector::open(CollectorConfig::default()).unwrap();
    collector.notify(event(1));
    let mut drifted = event(1);
    drifted.timestamp = at(500);
    collector.notify(drifted);
    collector.notify(event(2));

    assert_eq!(collector.delete(&[EventId::new(7, 1)]).unwrap(), 2);
    assert_eq!(collector.delete(&[EventId::new(7, 1)]).unwrap(), 0);
    assert_eq!(collector.store().len(), 1);
}

#[test]
fn test_unrecoverable_failure_revokes_registration() {
    let collector = DurableCollector::open(CollectorConfig::default()).unwrap();
    let healthy = collector.register(GrantDuration::secs(60)).unwrap();
    let doomed = collector.register(GrantDuration::secs(60)).unwrap();

    let healthy_stream = attach(&collector, healthy.token);
    let gone = FnTarget(|_: &Event| -> Result<(), DeliveryError> { Err(DeliveryError::unrecoverable("peer exited")) });
    collector.enable_delivery(doomed.token, Arc::new(gone)).unwrap();
    wait_until_live(&collector, healthy.token);
    wait_until_live(&collector, doomed.token);

    collector.ingest(event(1)).unwrap();
    collector.drain().unwrap();

    assert!(!collector.is_registered(doomed.token));
    assert!(collector.is_registered(healthy.token));
    assert_eq!(seqs(&healthy_stream.drain()), vec![1]);
    assert_eq!(collector.stats().revoked, 1);
}

#[test]
fn test_background_reaper_evicts_without_delivery() {
    let clock = ManualClock::new();
    let config = CollectorConfig {
        reaper_interval: Duration::from_millis(10),
        ..CollectorConfig::default()
    };
    let collector = DurableCollector::open_with_clock(config, Arc::new(clock.clone())).unwrap();
    let grant = collector.register(GrantDuration::secs(1)).unwrap();

    clock.advance(Duration::from_secs(2));
    let mut evicted = false;
    for _ in 0..200 {
        if collector.stats().reaped == 1 {
            evicted = true;
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(evicted);
    assert!(collector.registration_info(grant.token).is_none());
    assert!(collector.cancel(grant.token).is_err());
}

#[test]
fn test_unbounded_registration_never_expires() {
    let clock = ManualClock::new();
    let collector = DurableCollector::open_with_clock(CollectorConfig::default(), Arc::new(clock.clone())).unwrap();
    let grant = collector.register(GrantDuration::Unbounded).unwrap();

    clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
    assert!(collector.reap().is_empty());
    assert!(collector.is_registered(grant.token));
}
