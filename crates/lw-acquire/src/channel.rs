//! ---
//! lw_section: "04-signal-acquisition"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "ADC sources, offset calibration, RMS windows and EMA filtering."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Per-channel filter state and the window-to-reading step.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use lw_common::config::{AcquisitionConfig, ChannelConfig};
use lw_common::{ChannelId, RelayState};

use crate::calibration::ChannelOffsets;
use crate::source::AdcSource;
use crate::window::{WindowAccumulator, WindowReading};

/// Filtered snapshot of one channel, ready for publication.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Source channel.
    pub channel: ChannelId,
    /// Filtered RMS voltage, volts.
    pub voltage: f64,
    /// Filtered RMS current, amps.
    pub current: f64,
    /// Derived real power, watts.
    pub power: f64,
    /// Relay state at sampling time.
    pub relay_state: RelayState,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Current filtered values of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredReadings {
    /// Filtered RMS voltage, volts.
    pub voltage_v: f64,
    /// Filtered RMS current, amps.
    pub current_a: f64,
    /// Derived real power, watts.
    pub power_w: f64,
}

/// One supervised load: identity, calibration and live filter state.
///
/// The exponential filter seeds itself with the first windowed value
/// instead of climbing up from zero, so readings are honest from the very
/// first window. A window that produced no plausible samples for a metric
/// leaves that metric's filtered value untouched.
#[derive(Debug, Clone)]
pub struct LoadChannel {
    id: ChannelId,
    config: ChannelConfig,
    offsets: ChannelOffsets,
    filtered_voltage: Option<f64>,
    filtered_current: Option<f64>,
    relay: RelayState,
}

impl LoadChannel {
    /// Build a channel with its startup calibration. The relay starts open.
    pub fn new(id: ChannelId, config: ChannelConfig, offsets: ChannelOffsets) -> Self {
        Self {
            id,
            config,
            offsets,
            filtered_voltage: None,
            filtered_current: None,
            relay: RelayState::Off,
        }
    }

    /// Channel identity.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Configured human-facing label.
    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Current relay state.
    pub fn relay(&self) -> RelayState {
        self.relay
    }

    /// Record a relay transition decided by the control loop.
    pub fn set_relay(&mut self, state: RelayState) {
        self.relay = state;
    }

    /// Start a measurement window against this channel's calibration.
    pub fn begin_window(&self, acquisition: &AcquisitionConfig) -> WindowAccumulator {
        WindowAccumulator::new(acquisition, &self.config, self.offsets)
    }

    /// Fold one closed window into the filter state.
    ///
    /// Voltage is clamped to the configured ceiling before filtering, so a
    /// surge registers without a single spike poisoning the average for
    /// minutes. A windowed current under the noise floor pins the filter to
    /// exactly zero; an idle load must read 0 A, not a decaying residue.
    pub fn apply_window(&mut self, reading: &WindowReading, acquisition: &AcquisitionConfig) {
        if let Some(raw) = reading.voltage_rms {
            let clamped = raw.min(acquisition.voltage_clamp_v);
            if clamped < raw {
                debug!(
                    channel = %self.id,
                    raw_v = raw,
                    clamp_v = acquisition.voltage_clamp_v,
                    "window voltage clamped"
                );
            }
            self.filtered_voltage = Some(ema(
                self.filtered_voltage,
                clamped,
                acquisition.ema_alpha,
            ));
        }
        if let Some(raw) = reading.current_rms {
            if raw < acquisition.current_floor_a {
                self.filtered_current = Some(0.0);
            } else {
                self.filtered_current = Some(ema(
                    self.filtered_current,
                    raw,
                    acquisition.ema_alpha,
                ));
            }
        }
    }

    /// Filtered readings, once both metrics have seen at least one window.
    pub fn filtered(&self) -> Option<FilteredReadings> {
        let voltage_v = self.filtered_voltage?;
        let current_a = self.filtered_current?;
        Some(FilteredReadings {
            voltage_v,
            current_a,
            power_w: voltage_v * current_a,
        })
    }

    /// Publishable snapshot, `None` until the first complete window.
    pub fn sample(&self, now: DateTime<Utc>) -> Option<TelemetrySample> {
        self.filtered().map(|readings| TelemetrySample {
            channel: self.id,
            voltage: readings.voltage_v,
            current: readings.current_a,
            power: readings.power_w,
            relay_state: self.relay,
            timestamp: now,
        })
    }
}

fn ema(previous: Option<f64>, raw: f64, alpha: f64) -> f64 {
    match previous {
        None => raw,
        Some(previous) => (1.0 - alpha) * previous + alpha * raw,
    }
}

/// Run one full measurement window for both channels.
///
/// Samples are interleaved across the channels the way the converter mux
/// walks its inputs, then each closed window is folded into its channel's
/// filter state.
pub fn measure_window(
    source: &mut dyn AdcSource,
    acquisition: &AcquisitionConfig,
    channels: &mut [LoadChannel; 2],
) -> [WindowReading; 2] {
    let mut accumulators = [
        channels[0].begin_window(acquisition),
        channels[1].begin_window(acquisition),
    ];
    for _ in 0..acquisition.window_samples() {
        for id in ChannelId::ALL {
            accumulators[id.index()].push(source.sample(id));
        }
    }
    let readings = accumulators.map(WindowAccumulator::finish);
    for (channel, reading) in channels.iter_mut().zip(readings.iter()) {
        channel.apply_window(reading, acquisition);
    }
    readings
}
