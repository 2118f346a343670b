//! ---
//! lw_section: "01-core-functionality"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Shared primitives and utilities for the LoadWatch runtime."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Core shared primitives for the LoadWatch workspace.
//! This crate exposes configuration loading, logging bootstrap, loop-timing
//! helpers and the small domain vocabulary (channels, relay states, modes)
//! consumed across the workspace.

pub mod config;
pub mod logging;
pub mod timing;
pub mod types;

pub use config::{
    AcquisitionConfig, AppConfig, BusConfig, ChannelConfig, ChannelsConfig, ControlConfig,
    LoggingConfig, MetricsConfig, SentinelConfig, StoreConfig, SyntheticConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use timing::{civil_date, JitterHistogram, JitterSummary, LoopTimingReporter};
pub use types::{ChannelId, Issuer, OperatingMode, RelayState, Severity};
