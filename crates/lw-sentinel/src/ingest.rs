//! ---
//! lw_section: "06-anomaly-detection"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Bus-fed ingest: snapshot cache, daily peaks and the event trail."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::sync::Arc;

use lw_acquire::TelemetrySample;
use lw_bus::{
    AuditPayload, Broker, BusMessage, RelayStatusPayload, Subscription, TelemetryPayload, Topic,
};
use lw_common::{ChannelId, Issuer, RelayState, Severity};
use lw_store::{DailyPeaks, EventLogWriter};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::SnapshotCache;
use crate::event::{AnomalyEvent, AnomalyKind, Notifier, TriggeredAction};

/// The consuming half of the watchdog.
///
/// Subscribes to telemetry, relay status and the audit stream; every
/// message updates the snapshot cache, feeds the daily peak baselines and
/// lands in the event log. Firmware-side safety trips seen on the audit
/// stream are forwarded to the notifier so observers get protection events
/// from both layers in one place.
pub struct SentinelIngest {
    cache: Arc<SnapshotCache>,
    peaks: Arc<DailyPeaks>,
    event_log: Arc<Mutex<EventLogWriter>>,
    notifier: Arc<dyn Notifier>,
    telemetry_one: Subscription,
    telemetry_two: Subscription,
    status_one: Subscription,
    status_two: Subscription,
    audit: Subscription,
}

impl SentinelIngest {
    /// Subscribe to everything the watchdog consumes.
    pub fn new(
        broker: &Broker,
        cache: Arc<SnapshotCache>,
        peaks: Arc<DailyPeaks>,
        event_log: Arc<Mutex<EventLogWriter>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let client = broker.client("sentinel-ingest");
        Self {
            telemetry_one: client.subscribe(Topic::Telemetry(ChannelId::One)),
            telemetry_two: client.subscribe(Topic::Telemetry(ChannelId::Two)),
            status_one: client.subscribe(Topic::RelayStatus(ChannelId::One)),
            status_two: client.subscribe(Topic::RelayStatus(ChannelId::Two)),
            audit: client.subscribe(Topic::Audit),
            cache,
            peaks,
            event_log,
            notifier,
        }
    }

    /// Consume bus traffic until shutdown or broker teardown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!("sentinel ingest running");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                message = self.telemetry_one.recv() => {
                    let Some(message) = message else { break };
                    self.on_telemetry(ChannelId::One, &message);
                }
                message = self.telemetry_two.recv() => {
                    let Some(message) = message else { break };
                    self.on_telemetry(ChannelId::Two, &message);
                }
                message = self.status_one.recv() => {
                    let Some(message) = message else { break };
                    self.on_relay_status(ChannelId::One, &message);
                }
                message = self.status_two.recv() => {
                    let Some(message) = message else { break };
                    self.on_relay_status(ChannelId::Two, &message);
                }
                message = self.audit.recv() => {
                    let Some(message) = message else { break };
                    self.on_audit(&message);
                }
            }
        }
        info!("sentinel ingest stopped");
        Ok(())
    }

    fn on_telemetry(&self, channel: ChannelId, message: &BusMessage) {
        let payload: TelemetryPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%channel, %error, "malformed telemetry dropped");
                return;
            }
        };
        let sample = TelemetrySample {
            channel,
            voltage: payload.voltage,
            current: payload.current,
            power: payload.power,
            relay_state: self.cache.relay(channel),
            timestamp: message.published_at,
        };
        self.peaks
            .observe(channel, sample.power, sample.voltage, sample.timestamp);
        self.append("telemetry", serde_json::to_value(&sample));
        self.cache.insert(sample);
    }

    fn on_relay_status(&self, channel: ChannelId, message: &BusMessage) {
        let payload: RelayStatusPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%channel, %error, "malformed relay status dropped");
                return;
            }
        };
        self.cache
            .set_relay(channel, RelayState::from(payload.relay_state));
    }

    fn on_audit(&self, message: &BusMessage) {
        let payload: AuditPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "malformed audit record dropped");
                return;
            }
        };
        self.append("audit", serde_json::to_value(&payload));
        // A safety-issued OFF is the firmware layer acting on its own;
        // observers see it in the same stream as the detector's findings.
        if payload.issuer == Issuer::Safety && !payload.relay_state {
            self.notifier.notify(&AnomalyEvent {
                id: Uuid::new_v4(),
                channel: Some(payload.channel),
                kind: AnomalyKind::SafetyTrip,
                severity: Severity::Critical,
                message: format!("protection opened load {}", payload.channel),
                action: TriggeredAction::ForcedOff,
                timestamp: payload.timestamp,
            });
        }
    }

    fn append(&self, kind: &str, payload: serde_json::Result<serde_json::Value>) {
        match payload {
            Ok(payload) => {
                if let Err(error) = self.event_log.lock().append(kind, payload) {
                    warn!(kind, %error, "event log append failed");
                }
            }
            Err(error) => warn!(kind, %error, "record serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use chrono::Utc;
    use lw_common::{BusConfig, SentinelConfig};
    use lw_store::PeakStore;
    use tokio::task::JoinHandle;

    use crate::event::BroadcastNotifier;

    struct Rig {
        broker: Broker,
        cache: Arc<SnapshotCache>,
        peaks: Arc<DailyPeaks>,
        events: broadcast::Receiver<AnomalyEvent>,
        shutdown: broadcast::Sender<()>,
        handle: JoinHandle<anyhow::Result<()>>,
        log_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn spawn_rig() -> Rig {
        let broker = Broker::new(&BusConfig::default());
        let config = SentinelConfig::default();
        let cache = Arc::new(SnapshotCache::new(config.cache_ttl));
        let peaks = Arc::new(DailyPeaks::new(config.peak_reset_utc_offset_hours));
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("events.jsonl");
        let event_log = Arc::new(Mutex::new(EventLogWriter::open(&log_path).unwrap()));
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let events = notifier.subscribe();
        let ingest =
            SentinelIngest::new(&broker, cache.clone(), peaks.clone(), event_log, notifier);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(ingest.run(shutdown_rx));
        Rig {
            broker,
            cache,
            peaks,
            events,
            shutdown,
            handle,
            log_path,
            _dir: dir,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn telemetry_feeds_the_cache_and_the_peak_baseline() {
        let rig = spawn_rig();
        let meter = rig.broker.client("meter");

        meter
            .publish(
                Topic::RelayStatus(ChannelId::One),
                &RelayStatusPayload { relay_state: true },
            )
            .unwrap();
        meter
            .publish(
                Topic::Telemetry(ChannelId::One),
                &TelemetryPayload::from_readings(230.4, 4.3, 990.7),
            )
            .unwrap();
        settle().await;

        let now = Utc::now();
        let sample = rig.cache.latest(ChannelId::One, now).expect("cached sample");
        assert_eq!(sample.power, 990.7);
        assert_eq!(sample.voltage, 230.4);
        assert_eq!(sample.relay_state, RelayState::On);

        let peak = rig.peaks.today(ChannelId::One, now).expect("peak recorded");
        assert_eq!(peak.power_w, 990.7);
        assert_eq!(peak.voltage_v, 230.4);

        rig.shutdown.send(()).unwrap();
        rig.handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn safety_audits_surface_as_trip_events() {
        let mut rig = spawn_rig();
        let meter = rig.broker.client("meter");

        let tripped_at = Utc::now();
        meter
            .publish(
                Topic::Audit,
                &AuditPayload {
                    channel: ChannelId::Two,
                    relay_state: false,
                    issuer: Issuer::Safety,
                    timestamp: tripped_at,
                },
            )
            .unwrap();
        meter
            .publish(
                Topic::Audit,
                &AuditPayload {
                    channel: ChannelId::One,
                    relay_state: true,
                    issuer: Issuer::Manual,
                    timestamp: tripped_at,
                },
            )
            .unwrap();
        settle().await;

        let event = rig.events.try_recv().unwrap();
        assert_eq!(event.kind, AnomalyKind::SafetyTrip);
        assert_eq!(event.channel, Some(ChannelId::Two));
        assert_eq!(event.action, TriggeredAction::ForcedOff);
        assert_eq!(event.timestamp, tripped_at);
        // The manual transition is recorded but not forwarded.
        assert!(rig.events.try_recv().is_err());

        rig.shutdown.send(()).unwrap();
        rig.handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_event_log_carries_the_full_trail() {
        let rig = spawn_rig();
        let meter = rig.broker.client("meter");

        meter
            .publish(
                Topic::Telemetry(ChannelId::One),
                &TelemetryPayload::from_readings(229.8, 1.2, 275.8),
            )
            .unwrap();
        settle().await;
        meter
            .publish(
                Topic::Audit,
                &AuditPayload {
                    channel: ChannelId::One,
                    relay_state: false,
                    issuer: Issuer::Safety,
                    timestamp: Utc::now(),
                },
            )
            .unwrap();
        settle().await;

        rig.shutdown.send(()).unwrap();
        rig.handle.await.unwrap().unwrap();

        let mut kinds = Vec::new();
        lw_store::replay_event_log(&rig.log_path, |record| {
            kinds.push(record.kind);
            Ok(())
        })
        .unwrap();
        assert_eq!(kinds, ["telemetry", "audit"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_payloads_are_dropped_not_fatal() {
        let rig = spawn_rig();
        let meter = rig.broker.client("meter");

        meter
            .publish_value(
                Topic::Telemetry(ChannelId::One),
                serde_json::json!({ "volts": "nope" }),
            )
            .unwrap();
        meter
            .publish(
                Topic::Telemetry(ChannelId::One),
                &TelemetryPayload::from_readings(230.0, 2.0, 460.0),
            )
            .unwrap();
        settle().await;

        let sample = rig.cache.latest(ChannelId::One, Utc::now()).unwrap();
        assert_eq!(sample.power, 460.0);

        rig.shutdown.send(()).unwrap();
        rig.handle.await.unwrap().unwrap();
    }
}
