//! ---
//! lw_section: "04-signal-acquisition"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "ADC sources, offset calibration, RMS windows and EMA filtering."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Startup DC offset measurement.
//!
//! Sensor front-ends bias the AC waveform around a mid-scale level that
//! drifts from board to board. At startup, before anything switches, each
//! input is averaged over the configured sample count and the mean becomes
//! that metric's zero point for every later window.
use tracing::{info, warn};

use lw_common::config::AcquisitionConfig;
use lw_common::ChannelId;

use crate::source::AdcSource;
use crate::window::plausible_count;

/// Measured zero points for one channel's two inputs, in counts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelOffsets {
    /// Voltage input DC offset.
    pub voltage: f64,
    /// Current input DC offset.
    pub current: f64,
}

/// Per-channel DC offsets captured once at startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    offsets: [ChannelOffsets; 2],
}

impl Calibration {
    /// Average `calibration_samples` conversions per channel and take the
    /// mean of the plausible ones as the offset. Implausible samples
    /// (non-finite or outside the converter range) are skipped; a channel
    /// metric with no plausible samples falls back to a zero offset.
    pub fn measure(source: &mut dyn AdcSource, config: &AcquisitionConfig) -> Self {
        let mut offsets = [ChannelOffsets::default(); 2];
        for channel in ChannelId::ALL {
            let mut voltage_sum = 0.0;
            let mut voltage_count = 0u32;
            let mut current_sum = 0.0;
            let mut current_count = 0u32;
            for _ in 0..config.calibration_samples {
                let raw = source.sample(channel);
                if plausible_count(raw.voltage, config.adc_full_scale) {
                    voltage_sum += raw.voltage;
                    voltage_count += 1;
                }
                if plausible_count(raw.current, config.adc_full_scale) {
                    current_sum += raw.current;
                    current_count += 1;
                }
            }
            let entry = &mut offsets[channel.index()];
            entry.voltage = mean_or_zero(channel, "voltage", voltage_sum, voltage_count);
            entry.current = mean_or_zero(channel, "current", current_sum, current_count);
            info!(
                channel = %channel,
                voltage_offset = entry.voltage,
                current_offset = entry.current,
                samples = config.calibration_samples,
                "channel offsets calibrated"
            );
        }
        Self { offsets }
    }

    /// All-zero offsets, for sources that already deliver signed units.
    pub fn zero() -> Self {
        Self {
            offsets: [ChannelOffsets::default(); 2],
        }
    }

    /// Offsets pinned to exact mid-scale, for bench sources that centre
    /// their waveform there without noise.
    pub fn midscale(config: &AcquisitionConfig) -> Self {
        let level = config.adc_full_scale / 2.0;
        Self {
            offsets: [ChannelOffsets {
                voltage: level,
                current: level,
            }; 2],
        }
    }

    /// Offsets for one channel.
    pub fn offsets(&self, channel: ChannelId) -> ChannelOffsets {
        self.offsets[channel.index()]
    }
}

fn mean_or_zero(channel: ChannelId, input: &str, sum: f64, count: u32) -> f64 {
    if count == 0 {
        warn!(
            channel = %channel,
            input,
            "no plausible samples during calibration; offset held at zero"
        );
        return 0.0;
    }
    sum / f64::from(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{RawSample, SyntheticMains};

    #[test]
    fn measure_recovers_the_synthetic_midpoint() {
        let config = AcquisitionConfig::default();
        let mut source = SyntheticMains::new(&config).unwrap();
        let calibration = Calibration::measure(&mut source, &config);

        let midpoint = config.adc_full_scale / 2.0;
        for channel in ChannelId::ALL {
            let offsets = calibration.offsets(channel);
            // 4096 samples = 64 whole cycles, so the sine averages out and
            // only residual noise remains
            assert!((offsets.voltage - midpoint).abs() < 1.0, "{:?}", offsets);
            assert!((offsets.current - midpoint).abs() < 1.0, "{:?}", offsets);
        }
    }

    #[test]
    fn implausible_samples_are_skipped() {
        struct Glitchy(u32);
        impl AdcSource for Glitchy {
            fn sample(&mut self, _channel: ChannelId) -> RawSample {
                self.0 += 1;
                if self.0 % 2 == 0 {
                    RawSample {
                        voltage: f64::NAN,
                        current: -40.0,
                    }
                } else {
                    RawSample {
                        voltage: 100.0,
                        current: 100.0,
                    }
                }
            }
        }

        let config = AcquisitionConfig::default();
        let mut source = Glitchy(0);
        let calibration = Calibration::measure(&mut source, &config);
        let offsets = calibration.offsets(ChannelId::One);
        assert_eq!(offsets.voltage, 100.0);
        assert_eq!(offsets.current, 100.0);
    }

    #[test]
    fn constructed_calibrations_apply_to_both_channels() {
        let config = AcquisitionConfig::default();
        let midscale = Calibration::midscale(&config);
        assert_eq!(midscale.offsets(ChannelId::One).voltage, 2048.0);
        assert_eq!(midscale.offsets(ChannelId::Two).current, 2048.0);
        assert_eq!(Calibration::zero().offsets(ChannelId::Two).voltage, 0.0);
    }
}
