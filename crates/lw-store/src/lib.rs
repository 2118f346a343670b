//! ---
//! lw_section: "03-persistence-logging"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Daily peak tracking and append-only event log."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Durable bookkeeping for the anomaly detector: per-day peak maxima and
//! an append-only JSONL event log. The rest of the system treats both as
//! opaque seams ([`PeakStore`], [`EventLogWriter`]) so other backings can
//! be swapped in later.

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the store subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Wrapper for IO errors while reading or writing store files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub mod event_log;
pub mod peaks;

pub use event_log::replay as replay_event_log;
pub use event_log::{EventLogReader, EventLogWriter, EventRecord};
pub use peaks::{DailyPeaks, PeakSnapshot, PeakStore};
