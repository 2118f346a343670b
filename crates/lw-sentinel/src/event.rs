//! ---
//! lw_section: "06-anomaly-detection"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Anomaly events and the notifier fan-out seam."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use lw_common::{ChannelId, Severity};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Which rule the reading breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Channel power above the configured ratio of today's peak power.
    PowerNearPeak,
    /// Channel voltage above the configured ratio of today's peak voltage.
    VoltageNearPeak,
    /// Channel power above its fixed device ceiling.
    PowerCeiling,
    /// Combined draw of both channels above the system cap.
    SystemOverload,
    /// Firmware-side protection acted; forwarded from the audit stream.
    SafetyTrip,
}

/// What the watchdog did about a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredAction {
    /// A safety OFF command was published for the offending channel.
    CommandedOff,
    /// The relay was already forced open before this event was raised.
    ForcedOff,
    /// Recorded and fanned out only; no command left the watchdog.
    LoggedOnly,
}

/// One appended, never mutated record of a rule breach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// Unique event identity, for correlating log, store and notifications.
    pub id: Uuid,
    /// Offending channel; `None` for system-wide conditions.
    pub channel: Option<ChannelId>,
    /// Breached rule.
    pub kind: AnomalyKind,
    /// Weight of the breach.
    pub severity: Severity,
    /// Human-readable account with the observed and limiting values.
    pub message: String,
    /// Action taken when the event was raised.
    pub action: TriggeredAction,
    /// When the evaluation saw the breach.
    pub timestamp: DateTime<Utc>,
}

/// Outbound seam for anomaly events.
///
/// Implementations must not block: notification happens on the detector
/// tick and on the ingest path.
pub trait Notifier: Send + Sync {
    /// Deliver one event. Losing it is the implementation's prerogative.
    fn notify(&self, event: &AnomalyEvent);
}

/// Fans events out to any number of in-process observers.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<AnomalyEvent>,
}

impl BroadcastNotifier {
    /// Notifier with room for `capacity` undelivered events per observer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach an observer. Slow observers lag and lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<AnomalyEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: &AnomalyEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event.clone());
    }
}

/// Notifier that writes events to the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &AnomalyEvent) {
        match event.severity {
            Severity::Critical => warn!(
                target: "lw::sentinel",
                event_id = %event.id,
                kind = ?event.kind,
                channel = ?event.channel,
                action = ?event.action,
                "{}",
                event.message
            ),
            Severity::Warning => info!(
                target: "lw::sentinel",
                event_id = %event.id,
                kind = ?event.kind,
                channel = ?event.channel,
                action = ?event.action,
                "{}",
                event.message
            ),
        }
    }
}
