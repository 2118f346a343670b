//! ---
//! lw_section: "04-signal-acquisition"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "ADC sources, offset calibration, RMS windows and EMA filtering."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! The signal chain between raw ADC counts and filtered readings.
//!
//! One measurement window covers a whole number of AC cycles, so the RMS
//! integration never straddles a partial cycle. Per window and per metric:
//! subtract the startup DC offset, accumulate squares over the valid
//! samples, take the root of the mean and scale by the channel calibration
//! factor. The windowed value then feeds a per-channel EMA; voltage is
//! clamped before filtering and a current below the noise floor pins the
//! filter to exactly zero so an idle load reads 0 W, not milliwatt drift.

pub mod calibration;
pub mod channel;
pub mod source;
pub mod window;

/// Errors surfaced while building acquisition components.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// A source or filter parameter was outside its usable range.
    #[error("invalid acquisition parameter: {0}")]
    InvalidParameter(String),
}

pub use calibration::{Calibration, ChannelOffsets};
pub use channel::{measure_window, FilteredReadings, LoadChannel, TelemetrySample};
pub use source::{AdcSource, RawSample, ScriptedSource, ScriptedWindow, SyntheticMains};
pub use window::{WindowAccumulator, WindowReading};
