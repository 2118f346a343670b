//! ---
//! lw_section: "02-messaging-telemetry-bus"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Telemetry bus topics, wire payloads and in-process broker."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Lossy publish/subscribe plumbing between the meter node and its
//! backends.
//!
//! Delivery is at-most-once by construction: subscriber queues are bounded
//! and overflow drops the message for that subscriber, a severed link loses
//! everything published or addressed to it, and nothing is ever queued for
//! replay. Messages on one topic reach a given subscriber in publish order;
//! across topics there is no ordering guarantee. Consumers are therefore
//! written against self-contained snapshots, never deltas.

pub mod broker;
pub mod chaos;
pub mod link;
pub mod payload;
pub mod topic;

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The client's link is currently severed; the publish was lost.
    #[error("link for client '{0}' is disconnected")]
    Disconnected(String),
    /// A topic string did not parse.
    #[error(transparent)]
    Topic(#[from] topic::TopicParseError),
    /// An inbound payload failed normalization.
    #[error("malformed payload: {0}")]
    Payload(#[from] payload::PayloadError),
    /// Serialization of an outbound payload failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use broker::{
    log_activity, Broker, BusClient, BusCounters, BusMessage, BusMetrics, MessageDirection,
    Subscription,
};
pub use chaos::ChaosPolicy;
pub use link::{LinkFault, LinkState};
pub use payload::{
    decode_environment, decode_mode, decode_relay_command, AuditPayload, Command,
    EnvironmentReading, PayloadError, RelayStatusPayload, TelemetryPayload,
};
pub use topic::{Topic, TopicParseError};
