//! Producers, subscription clients and discovery feeding a collector.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;

use herald::{
    ChannelTarget, ClientConfig, CollectorConfig, ConnectionState, DiscoveryContext, DiscoveryEvent, DispatchMode,
    DurableCollector, EventDescriptor, FixedCeilingPolicy, GrantDuration, LocalProducer, ProducerDiscovery,
    ProducerId, SubscriptionClient, SystemClock,
};

const ALARM: u64 = 11;

fn producer(id: &str, mode: DispatchMode) -> Arc<LocalProducer> {
    Arc::new(
        LocalProducer::new(
            ProducerId::new(id),
            Arc::new(FixedCeilingPolicy::new(Duration::from_secs(60))),
            Arc::new(SystemClock),
        )
        .advertise(EventDescriptor::new("plant.alarm", ALARM), mode),
    )
}

fn client_config() -> ClientConfig {
    ClientConfig {
        retry_wait: Duration::from_millis(5),
        default_duration: GrantDuration::secs(10),
        ..ClientConfig::default()
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_producer_to_collector_through_client() {
    let collector = Arc::new(DurableCollector::open(CollectorConfig::default()).unwrap());
    let registration = collector.register(GrantDuration::secs(60)).unwrap();
    let (target, stream) = ChannelTarget::unbounded();
    collector.enable_delivery(registration.token, Arc::new(target)).unwrap();

    let client = SubscriptionClient::new(client_config(), collector.clone()).unwrap();
    let source = producer("boiler", DispatchMode::Broadcast);
    client
        .connect(source.clone(), &EventDescriptor::new("plant.alarm", ALARM))
        .unwrap();
    assert_eq!(client.state(&ProducerId::new("boiler"), ALARM), Some(ConnectionState::Connected));

    for n in 0..5 {
        source.fire(ALARM, serde_json::json!({ "n": n })).unwrap();
    }
    collector.drain().unwrap();

    let received = stream.collect(5, Duration::from_secs(2));
    let sequences: Vec<_> = received.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    assert_eq!(collector.store().len(), 5);

    client.drop_all();
    assert_eq!(source.dispatcher(ALARM).unwrap().listener_count(), 0);
}

#[test]
fn test_rotating_producer_spreads_events_across_clients() {
    let source = producer("pump", DispatchMode::Rotating);
    let descriptor = EventDescriptor::new("plant.alarm", ALARM);

    let (a, stream_a) = ChannelTarget::unbounded();
    let (b, stream_b) = ChannelTarget::unbounded();
    let client_a = SubscriptionClient::new(client_config(), Arc::new(a)).unwrap();
    let client_b = SubscriptionClient::new(client_config(), Arc::new(b)).unwrap();
    client_a.connect(source.clone(), &descriptor).unwrap();
    client_b.connect(source.clone(), &descriptor).unwrap();

    for n in 0..6 {
        let report = source.fire(ALARM, serde_json::json!(n)).unwrap();
        assert_eq!(report.delivered, 1);
    }

    assert_eq!(stream_a.drain().len(), 3);
    assert_eq!(stream_b.drain().len(), 3);
}

#[test]
fn test_discovery_fans_in_and_follows_departures() {
    let collector = Arc::new(DurableCollector::open(CollectorConfig::default()).unwrap());
    let client = Arc::new(SubscriptionClient::new(client_config(), collector.clone()).unwrap());
    let (events_tx, events_rx) = unbounded();
    let discovery = ProducerDiscovery::start(
        DiscoveryContext::new(Arc::clone(&client), EventDescriptor::new("plant.alarm", ALARM)),
        events_rx,
    )
    .unwrap();

    let north = producer("north", DispatchMode::Broadcast);
    let south = producer("south", DispatchMode::Broadcast);
    events_tx.send(DiscoveryEvent::Joined(north.clone())).unwrap();
    events_tx.send(DiscoveryEvent::Joined(south.clone())).unwrap();
    assert!(wait_for(|| client.connections().len() == 2));

    north.fire(ALARM, serde_json::json!("n")).unwrap();
    thread::sleep(Duration::from_millis(2));
    south.fire(ALARM, serde_json::json!("s")).unwrap();
    collector.drain().unwrap();
    assert_eq!(collector.store().len(), 2);

    events_tx.send(DiscoveryEvent::Left(ProducerId::new("north"))).unwrap();
    assert!(wait_for(|| north.dispatcher(ALARM).unwrap().listener_count() == 0));
    assert_eq!(south.dispatcher(ALARM).unwrap().listener_count(), 1);

    discovery.terminate();
    assert!(client.connections().is_empty());
    assert_eq!(south.dispatcher(ALARM).unwrap().listener_count(), 0);
}
