//! ---
//! lw_section: "07-testing-qa"
//! lw_subsection: "integration-tests"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Link outage scenarios: at-most-once delivery and stale-data holdoff."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Severs one client's bus link mid-run. Delivery is at-most-once, so
//! traffic during the outage is gone for good, and the watchdog must go
//! quiet rather than act on the snapshot it can no longer refresh.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use lw_bus::{Broker, BusMessage, RelayStatusPayload, Subscription, TelemetryPayload, Topic};
use lw_common::{AppConfig, ChannelId};
use lw_sentinel::{AnomalyKind, BroadcastNotifier, Sentinel, SentinelIngest, SnapshotCache};
use lw_store::{DailyPeaks, EventLogWriter};

async fn next_within(subscription: &mut Subscription, millis: u64) -> BusMessage {
    timeout(Duration::from_millis(millis), subscription.recv())
        .await
        .expect("no message within the deadline")
        .expect("bus closed")
}

fn telemetry(voltage: f64, current: f64, power: f64) -> TelemetryPayload {
    TelemetryPayload {
        voltage,
        current,
        power,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_severed_subscriber_misses_traffic_and_heals_without_backlog() {
    let config = AppConfig::default();
    let broker = Broker::new(&config.bus);
    let meter = broker.client("meter-sim");
    let backend = broker.client("backend");
    let mut readings = backend.subscribe(Topic::Telemetry(ChannelId::One));
    let mut status = backend.subscribe(Topic::RelayStatus(ChannelId::One));

    meter
        .publish(Topic::Telemetry(ChannelId::One), &telemetry(230.0, 4.3, 989.0))
        .unwrap();
    let healthy = next_within(&mut readings, 500).await;
    assert_eq!(healthy.payload["voltage"], 230.0);

    let fault = backend.link_fault();
    fault.sever();
    assert!(!backend.is_connected());

    // Routing is synchronous, so everything published here is already
    // decided: skipped at the broker, never queued.
    for _ in 0..10 {
        meter
            .publish(Topic::Telemetry(ChannelId::One), &telemetry(230.0, 4.3, 989.0))
            .unwrap();
    }
    meter
        .publish(
            Topic::RelayStatus(ChannelId::One),
            &RelayStatusPayload { relay_state: true },
        )
        .unwrap();
    assert!(readings.try_recv().is_none(), "severed link must not deliver");
    assert!(status.try_recv().is_none());

    fault.restore();
    assert!(backend.is_connected());

    // Only traffic published after the heal arrives; nothing replays.
    meter
        .publish(Topic::Telemetry(ChannelId::One), &telemetry(231.5, 4.3, 995.5))
        .unwrap();
    let fresh = next_within(&mut readings, 500).await;
    assert_eq!(fresh.payload["voltage"], 231.5);
    assert!(readings.try_recv().is_none(), "no backlog after heal");
    assert!(status.try_recv().is_none(), "the missed status is gone for good");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_telemetry_suspends_the_watchdog_until_fresh_data() {
    let mut config = AppConfig::default();
    config.sentinel.cache_ttl = Duration::from_millis(250);
    let dir = TempDir::new().unwrap();
    let broker = Broker::new(&config.bus);

    let cache = Arc::new(SnapshotCache::new(config.sentinel.cache_ttl));
    let peaks = Arc::new(DailyPeaks::new(config.sentinel.peak_reset_utc_offset_hours));
    let event_log = Arc::new(Mutex::new(
        EventLogWriter::open(&dir.path().join("events.jsonl")).unwrap(),
    ));
    let notifier = Arc::new(BroadcastNotifier::new(16));
    let mut alerts = notifier.subscribe();

    let ingest = SentinelIngest::new(
        &broker,
        Arc::clone(&cache),
        Arc::clone(&peaks),
        Arc::clone(&event_log),
        notifier.clone(),
    );
    let sentinel = Sentinel::new(
        config.sentinel.clone(),
        &broker,
        cache,
        peaks,
        event_log,
        notifier,
        None,
    );

    let (shutdown, _) = broadcast::channel(1);
    let ingest_task = tokio::spawn(ingest.run(shutdown.subscribe()));

    let meter = broker.client("meter-sim");
    let mut commands = meter.subscribe(Topic::RelayControl(ChannelId::Two));

    // Raise the daily peaks well above the ceiling first, so only the
    // fixed 2 kW rule can fire in the rest of the scenario.
    meter
        .publish(Topic::Telemetry(ChannelId::Two), &telemetry(245.0, 12.2, 3000.0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    meter
        .publish(Topic::Telemetry(ChannelId::Two), &telemetry(230.0, 10.9, 2500.0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    sentinel.tick(Utc::now());
    assert!(commands.try_recv().is_some(), "fresh breach sheds the load");
    let alert = alerts.try_recv().expect("ceiling breach reported");
    assert_eq!(alert.kind, AnomalyKind::PowerCeiling);
    assert!(alerts.try_recv().is_err());

    // Nothing new arrives; the snapshot ages past its 250 ms budget and
    // the breach is still real, but acting on it would be guesswork.
    tokio::time::sleep(Duration::from_millis(300)).await;
    sentinel.tick(Utc::now());
    assert!(commands.try_recv().is_none(), "stale data must not shed");
    assert!(alerts.try_recv().is_err());

    // Fresh data resumes enforcement on the next tick.
    meter
        .publish(Topic::Telemetry(ChannelId::Two), &telemetry(230.0, 10.9, 2500.0))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    sentinel.tick(Utc::now());
    assert!(commands.try_recv().is_some());

    shutdown.send(()).unwrap();
    ingest_task.await.unwrap().unwrap();
}
