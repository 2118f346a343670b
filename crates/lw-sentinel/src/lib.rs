//! ---
//! lw_section: "06-anomaly-detection"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Backend watchdog over telemetry: dynamic and fixed trip rules."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! The second, slower layer of protection.
//!
//! The meter firmware trips on fixed absolute ceilings within one
//! measurement window. This crate re-evaluates the same telemetry on its
//! own tick against baselines the firmware cannot know: today's recorded
//! peaks and the aggregate draw across both channels. The two layers are
//! complementary and deliberately independent; neither waits for the
//! other.
//!
//! The watchdog never touches a relay. Every decision leaves the crate as
//! a safety-issued OFF command on the bus, an append to the event log and
//! a fan-out through the [`Notifier`] seam. Whether the command lands is
//! the control loop's business.

pub mod cache;
pub mod event;
pub mod ingest;
pub mod sentinel;

pub use cache::SnapshotCache;
pub use event::{
    AnomalyEvent, AnomalyKind, BroadcastNotifier, LogNotifier, Notifier, TriggeredAction,
};
pub use ingest::SentinelIngest;
pub use sentinel::{Sentinel, Violation};
