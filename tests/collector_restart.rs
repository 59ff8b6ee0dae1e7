//! Restart survival for the persistent collector.
//!
//! These tests verify that:
//! - Stored events and live registrations come back after a restart
//! - Reloaded registrations resume from their persisted cursor
//! - Lapsed registrations and corrupt records are dropped during reload
//! - A data directory cannot be opened twice

#![cfg(feature = "persistent")]

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::tempdir;

use herald::store::record_name;
use herald::{
    ChannelTarget, CollectorConfig, DeliveryError, DeliveryTarget, DurableCollector, Event, EventDescriptor, EventId,
    FnTarget, GrantDuration, GrantToken, HeraldError, ManualClock, StorageError,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn event(seq: u64) -> Event {
    Event::new(
        &EventDescriptor::new("plant.pressure", 3),
        seq,
        at(i64::try_from(seq).unwrap()),
        serde_json::json!({ "bar": seq }),
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

#[test]
fn test_events_and_registrations_survive_restart() {
    let dir = tempdir().unwrap();

    let token = {
        let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
        let grant = collector.register(GrantDuration::secs(600)).unwrap();
        for seq in 1..=4 {
            collector.ingest(event(seq)).unwrap();
        }
        collector.drain().unwrap();
        collector.terminate();
        grant.token
    };

    let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
    assert_eq!(collector.store().len(), 4);
    assert!(collector.is_registered(token));

    let info = collector.registration_info(token).unwrap();
    assert!(!info.attached);
    assert!(!info.replaying);

    let (target, stream) = ChannelTarget::unbounded();
    collector.enable_delivery(token, Arc::new(target)).unwrap();
    assert_eq!(seqs(&stream.collect(4, Duration::from_secs(2))), vec![1, 2, 3, 4]);
}

#[test]
fn test_reloaded_registration_resumes_from_cursor() {
    let dir = tempdir().unwrap();

    let token = {
        let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
        let grant = collector.register(GrantDuration::secs(600)).unwrap();
        collector.notify(event(1));
        collector.notify(event(2));

        let (target, stream) = ChannelTarget::unbounded();
        collector.enable_delivery(grant.token, Arc::new(target)).unwrap();
        assert_eq!(stream.collect(2, Duration::from_secs(2)).len(), 2);
        wait_until_live(&collector, grant.token);
        collector.disable_delivery(grant.token).unwrap();

        collector.notify(event(3));
        grant.token
    };

    let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
    let (target, stream) = ChannelTarget::unbounded();
    collector.enable_delivery(token, Arc::new(target)).unwrap();
    wait_until_live(&collector, token);

    assert_eq!(seqs(&stream.drain()), vec![3]);
}

#[test]
fn test_renewal_is_persisted() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new();

    let token = {
        let collector =
            DurableCollector::open_with_clock(CollectorConfig::persistent(dir.path()), Arc::new(clock.clone())).unwrap();
        let grant = collector.register(GrantDuration::secs(10)).unwrap();
        clock.advance(Duration::from_secs(8));
        collector.renew(grant.token, GrantDuration::secs(60)).unwrap();
        grant.token
    };

    clock.advance(Duration::from_secs(30));
    let collector =
        DurableCollector::open_with_clock(CollectorConfig::persistent(dir.path()), Arc::new(clock.clone())).unwrap();
    assert!(collector.is_registered(token));
}

#[test]
fn test_lapsed_and_cancelled_registrations_are_not_reloaded() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new();
    let config = || CollectorConfig {
        reaper_interval: Duration::from_secs(3600),
        ..CollectorConfig::persistent(dir.path())
    };

    let (short, cancelled, kept) = {
        let collector = DurableCollector::open_with_clock(config(), Arc::new(clock.clone())).unwrap();
        let short = collector.register(GrantDuration::secs(5)).unwrap();
        let cancelled = collector.register(GrantDuration::secs(600)).unwrap();
        let kept = collector.register(GrantDuration::secs(600)).unwrap();
        collector.cancel(cancelled.token).unwrap();
        (short.token, cancelled.token, kept.token)
    };

    clock.advance(Duration::from_secs(60));
    let collector = DurableCollector::open_with_clock(config(), Arc::new(clock.clone())).unwrap();
    assert!(!collector.is_registered(short));
    assert!(!collector.is_registered(cancelled));
    assert_eq!(collector.tokens(), vec![kept]);

    let remaining: Vec<_> = fs::read_dir(dir.path().join("registrations"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(remaining, vec![format!("reg-{kept}.rec")]);
}

#[test]
fn test_deleted_events_stay_deleted() {
    let dir = tempdir().unwrap();
    {
        let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
        for seq in 1..=3 {
            collector.notify(event(seq));
        }
        collector.store().flush().unwrap();
        assert_eq!(collector.delete(&[EventId::new(3, 2)]).unwrap(), 1);
    }

    let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
    assert_eq!(collector.store().len(), 2);
    assert!(collector.store().get(EventId::new(3, 2)).is_none());
}

#[test]
fn test_failed_record_removal_still_purges_rejection_markers() {
    let dir = tempdir().unwrap();
    let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
    let grant = collector.register(GrantDuration::secs(600)).unwrap();
    let (inner, _stream) = ChannelTarget::unbounded();
    let picky = FnTarget(move |e: &Event| -> Result<(), DeliveryError> {
        if e.kind == "plant.valve" {
            return Err(DeliveryError::unrecognized(e.kind.clone()));
        }
        inner.deliver(e)
    });
    collector.enable_delivery(grant.token, Arc::new(picky)).unwrap();
    wait_until_live(&collector, grant.token);

    let valve = Event::new(&EventDescriptor::new("plant.valve", 4), 1, at(1), serde_json::Value::Null);
    collector.notify(valve.clone());
    collector.store().flush().unwrap();
    assert_eq!(
        collector.registration_info(grant.token).unwrap().rejected_kinds,
        vec!["plant.valve".to_string()]
    );

    // A directory squatting on the record name makes the removal fail.
    let record = dir.path().join("events").join(record_name(&valve));
    fs::remove_file(&record).unwrap();
    fs::create_dir(&record).unwrap();
    fs::write(record.join("keep"), b"x").unwrap();

    let err = collector.delete(&[valve.id()]).unwrap_err();
    assert!(matches!(err, HeraldError::Storage(StorageError::Io { .. })));
    assert!(collector.store().get(valve.id()).is_none());
    assert!(collector.registration_info(grant.token).unwrap().rejected_kinds.is_empty());
}

#[test]
fn test_corrupt_records_are_skipped() {
    let dir = tempdir().unwrap();
    {
        let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
        collector.notify(event(1));
        collector.notify(event(2));
    }

    let events_dir = dir.path().join("events");
    let mut names: Vec<_> = fs::read_dir(&events_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    names.sort();
    assert_eq!(names.len(), 2);

    // Flip a byte in the middle of the first record and leave a torn temp file behind.
    let mut bytes = fs::read(&names[0]).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(&names[0], bytes).unwrap();
    fs::write(events_dir.join("evt-99.rec.tmp.0123"), b"HRLD").unwrap();
    fs::write(dir.path().join("registrations").join("reg-garbage.rec"), b"nope").unwrap();

    let collector = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();
    assert_eq!(collector.store().len(), 1);
    assert!(collector.store().get(EventId::new(3, 2)).is_some());
    assert!(!events_dir.join("evt-99.rec.tmp.0123").exists());
}

#[test]
fn test_data_directory_is_exclusive() {
    let dir = tempdir().unwrap();
    let _first = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap();

    let err = DurableCollector::open(CollectorConfig::persistent(dir.path())).unwrap_err();
    assert!(matches!(err, HeraldError::Storage(StorageError::Locked { .. })));
}
