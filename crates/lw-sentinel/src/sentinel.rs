//! ---
//! lw_section: "06-anomaly-detection"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Detector tick: dynamic peak-relative and fixed threshold rules."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lw_acquire::TelemetrySample;
use lw_bus::{Broker, BusClient, Command, Topic};
use lw_common::{ChannelId, Issuer, RelayState, SentinelConfig, Severity};
use lw_metrics::SentinelMetrics;
use lw_rt::RateLimiter;
use lw_store::{EventLogWriter, PeakStore};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::SnapshotCache;
use crate::event::{AnomalyEvent, AnomalyKind, Notifier, TriggeredAction};

/// One rule breach found by an evaluation pass.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Offending channel; `None` for the aggregate rule.
    pub channel: Option<ChannelId>,
    /// Breached rule.
    pub kind: AnomalyKind,
    /// Configured weight for dynamic rules, `Critical` for fixed ones.
    pub severity: Severity,
    /// Account of the breach with the observed and limiting values.
    pub message: String,
    /// Channel the watchdog wants off.
    pub shed: ChannelId,
}

/// The detector half of the watchdog.
///
/// [`Sentinel::evaluate`] is pure over the snapshot cache and the peak
/// store; [`Sentinel::tick`] applies the effects: at most one safety OFF
/// command per channel per tick, one event-log append and one notification
/// per violation.
pub struct Sentinel {
    config: SentinelConfig,
    cache: Arc<SnapshotCache>,
    peaks: Arc<dyn PeakStore>,
    client: BusClient,
    event_log: Arc<Mutex<EventLogWriter>>,
    notifier: Arc<dyn Notifier>,
    metrics: Option<SentinelMetrics>,
}

impl Sentinel {
    /// Detector publishing as its own bus client.
    pub fn new(
        config: SentinelConfig,
        broker: &Broker,
        cache: Arc<SnapshotCache>,
        peaks: Arc<dyn PeakStore>,
        event_log: Arc<Mutex<EventLogWriter>>,
        notifier: Arc<dyn Notifier>,
        metrics: Option<SentinelMetrics>,
    ) -> Self {
        Self {
            config,
            cache,
            peaks,
            client: broker.client("sentinel"),
            event_log,
            notifier,
            metrics,
        }
    }

    /// Tick on the configured interval until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut limiter = RateLimiter::new(self.config.tick_interval);
        info!(interval = ?self.config.tick_interval, "sentinel detector running");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = limiter.tick() => self.tick(Utc::now()),
            }
        }
        info!("sentinel detector stopped");
        Ok(())
    }

    /// One evaluation pass and its effects.
    pub fn tick(&self, now: DateTime<Utc>) {
        let violations = self.evaluate(now);
        if let Some(metrics) = &self.metrics {
            metrics.record_evaluation();
        }
        let mut commanded = [false; 2];
        for violation in violations {
            let action = self.shed(violation.shed, &mut commanded);
            self.record(&AnomalyEvent {
                id: Uuid::new_v4(),
                channel: violation.channel,
                kind: violation.kind,
                severity: violation.severity,
                message: violation.message,
                action,
                timestamp: now,
            });
        }
    }

    /// Apply every rule to the freshest cached telemetry.
    ///
    /// A channel without a fresh sample is skipped entirely; a channel
    /// without a peak baseline today is only checked against fixed rules.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut cached: [Option<TelemetrySample>; 2] = [None, None];

        for channel in ChannelId::ALL {
            let Some(sample) = self.cache.latest(channel, now) else {
                continue;
            };

            if let Some(peak) = self.peaks.today(channel, now) {
                let power_limit = self.config.power_peak_ratio * peak.power_w;
                if sample.power > power_limit {
                    violations.push(Violation {
                        channel: Some(channel),
                        kind: AnomalyKind::PowerNearPeak,
                        severity: self.config.dynamic_severity,
                        message: format!(
                            "load {} power {:.1} W exceeds {:.0}% of today's peak {:.1} W",
                            channel,
                            sample.power,
                            self.config.power_peak_ratio * 100.0,
                            peak.power_w
                        ),
                        shed: channel,
                    });
                }
                let voltage_limit = self.config.voltage_peak_ratio * peak.voltage_v;
                if sample.voltage > voltage_limit {
                    violations.push(Violation {
                        channel: Some(channel),
                        kind: AnomalyKind::VoltageNearPeak,
                        severity: self.config.dynamic_severity,
                        message: format!(
                            "load {} voltage {:.1} V exceeds {:.0}% of today's peak {:.1} V",
                            channel,
                            sample.voltage,
                            self.config.voltage_peak_ratio * 100.0,
                            peak.voltage_v
                        ),
                        shed: channel,
                    });
                }
            }

            let ceiling = self.config.power_ceiling_w(channel);
            if sample.power > ceiling {
                violations.push(Violation {
                    channel: Some(channel),
                    kind: AnomalyKind::PowerCeiling,
                    severity: Severity::Critical,
                    message: format!(
                        "load {} power {:.1} W exceeds its {:.0} W ceiling",
                        channel, sample.power, ceiling
                    ),
                    shed: channel,
                });
            }

            cached[channel.index()] = Some(sample);
        }

        let total: f64 = cached.iter().flatten().map(|sample| sample.power).sum();
        if total > self.config.system_power_cap_w {
            if let Some(victim) = shed_candidate(&cached) {
                violations.push(Violation {
                    channel: None,
                    kind: AnomalyKind::SystemOverload,
                    severity: Severity::Critical,
                    message: format!(
                        "combined draw {:.1} W exceeds the {:.0} W system cap; shedding load {}",
                        total, self.config.system_power_cap_w, victim
                    ),
                    shed: victim,
                });
            }
        }

        violations
    }

    fn shed(&self, channel: ChannelId, commanded: &mut [bool; 2]) -> TriggeredAction {
        if commanded[channel.index()] {
            // The OFF already sent this tick covers this breach too.
            return TriggeredAction::CommandedOff;
        }
        let command = Command {
            channel,
            desired: RelayState::Off,
            issuer: Issuer::Safety,
        };
        match self
            .client
            .publish_value(Topic::RelayControl(channel), command.wire_payload())
        {
            Ok(_) => {
                commanded[channel.index()] = true;
                info!(%channel, "safety off command published");
                TriggeredAction::CommandedOff
            }
            Err(error) => {
                warn!(%channel, %error, "safety off command lost; recording only");
                TriggeredAction::LoggedOnly
            }
        }
    }

    fn record(&self, event: &AnomalyEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record_anomaly(event.severity);
        }
        match serde_json::to_value(event) {
            Ok(payload) => {
                if let Err(error) = self.event_log.lock().append("anomaly", payload) {
                    warn!(%error, "anomaly event append failed");
                }
            }
            Err(error) => warn!(%error, "anomaly event serialization failed"),
        }
        self.notifier.notify(event);
    }
}

/// The channel to shed for an aggregate breach: the heaviest channel whose
/// relay is on, or failing that the heaviest channel seen at all.
fn shed_candidate(cached: &[Option<TelemetrySample>; 2]) -> Option<ChannelId> {
    cached
        .iter()
        .flatten()
        .filter(|sample| sample.relay_state.is_on())
        .max_by(|a, b| a.power.total_cmp(&b.power))
        .or_else(|| {
            cached
                .iter()
                .flatten()
                .max_by(|a, b| a.power.total_cmp(&b.power))
        })
        .map(|sample| sample.channel)
}
