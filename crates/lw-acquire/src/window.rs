//! ---
//! lw_section: "04-signal-acquisition"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "ADC sources, offset calibration, RMS windows and EMA filtering."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Whole-cycle RMS windows.
use lw_common::config::{AcquisitionConfig, ChannelConfig};

use crate::calibration::ChannelOffsets;
use crate::source::RawSample;

/// A raw count is usable when it is finite and inside the converter range.
pub(crate) fn plausible_count(value: f64, full_scale: f64) -> bool {
    value.is_finite() && (0.0..=full_scale).contains(&value)
}

/// RMS result of one measurement window.
///
/// Each metric is independent: a sensor fault on one input never poisons
/// the other. `None` means the window held no plausible sample for that
/// metric, in which case the caller keeps its previous filtered value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowReading {
    /// RMS voltage over the window, volts. `None` when no sample was valid.
    pub voltage_rms: Option<f64>,
    /// RMS current over the window, amps. `None` when no sample was valid.
    pub current_rms: Option<f64>,
    /// Plausible voltage samples in the window.
    pub voltage_samples: u32,
    /// Plausible current samples in the window.
    pub current_samples: u32,
}

/// Accumulates one window of squared, offset-corrected samples.
#[derive(Debug)]
pub struct WindowAccumulator {
    full_scale: f64,
    offsets: ChannelOffsets,
    voltage_cal: f64,
    current_cal: f64,
    target: u32,
    offered: u32,
    voltage_sumsq: f64,
    voltage_count: u32,
    current_sumsq: f64,
    current_count: u32,
}

impl WindowAccumulator {
    /// Start a window for one channel.
    pub fn new(
        config: &AcquisitionConfig,
        channel: &ChannelConfig,
        offsets: ChannelOffsets,
    ) -> Self {
        Self {
            full_scale: config.adc_full_scale,
            offsets,
            voltage_cal: channel.voltage_cal,
            current_cal: channel.current_cal,
            target: config.window_samples(),
            offered: 0,
            voltage_sumsq: 0.0,
            voltage_count: 0,
            current_sumsq: 0.0,
            current_count: 0,
        }
    }

    /// Fold one conversion pair into the window. Implausible counts are
    /// skipped per metric and do not shorten the window.
    pub fn push(&mut self, raw: RawSample) {
        self.offered += 1;
        if plausible_count(raw.voltage, self.full_scale) {
            let centred = raw.voltage - self.offsets.voltage;
            self.voltage_sumsq += centred * centred;
            self.voltage_count += 1;
        }
        if plausible_count(raw.current, self.full_scale) {
            let centred = raw.current - self.offsets.current;
            self.current_sumsq += centred * centred;
            self.current_count += 1;
        }
    }

    /// True once the window has been offered its full sample count.
    pub fn is_complete(&self) -> bool {
        self.offered >= self.target
    }

    /// Close the window: root of the mean square, scaled by calibration.
    pub fn finish(self) -> WindowReading {
        let rms = |sumsq: f64, count: u32, cal: f64| {
            (count > 0).then(|| (sumsq / f64::from(count)).sqrt() * cal)
        };
        WindowReading {
            voltage_rms: rms(self.voltage_sumsq, self.voltage_count, self.voltage_cal),
            current_rms: rms(self.current_sumsq, self.current_count, self.current_cal),
            voltage_samples: self.voltage_count,
            current_samples: self.current_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::source::{AdcSource, ScriptedSource, ScriptedWindow};
    use lw_common::ChannelId;

    fn channel_config(voltage_cal: f64, current_cal: f64) -> ChannelConfig {
        let mut config = lw_common::config::ChannelsConfig::default().load1;
        config.voltage_cal = voltage_cal;
        config.current_cal = current_cal;
        config
    }

    fn run_window(
        config: &AcquisitionConfig,
        channel: &ChannelConfig,
        source: &mut ScriptedSource,
    ) -> WindowReading {
        let offsets = Calibration::midscale(config).offsets(ChannelId::One);
        let mut accumulator = WindowAccumulator::new(config, channel, offsets);
        while !accumulator.is_complete() {
            accumulator.push(source.sample(ChannelId::One));
        }
        accumulator.finish()
    }

    #[test]
    fn whole_cycle_sine_recovers_exact_rms() {
        let config = AcquisitionConfig::default();
        let mut source = ScriptedSource::new(&config);
        source.enqueue(
            ChannelId::One,
            ScriptedWindow {
                voltage_rms: 230.0,
                current_rms: 4.3,
            },
        );

        let reading = run_window(&config, &channel_config(1.0, 1.0), &mut source);
        assert!((reading.voltage_rms.unwrap() - 230.0).abs() < 1e-9);
        assert!((reading.current_rms.unwrap() - 4.3).abs() < 1e-9);
        assert_eq!(reading.voltage_samples, config.window_samples());
    }

    #[test]
    fn calibration_factor_scales_the_result() {
        let config = AcquisitionConfig::default();
        let mut source = ScriptedSource::new(&config);
        source.enqueue(
            ChannelId::One,
            ScriptedWindow {
                voltage_rms: 100.0,
                current_rms: 1.0,
            },
        );

        let reading = run_window(&config, &channel_config(2.0, 0.5), &mut source);
        assert!((reading.voltage_rms.unwrap() - 200.0).abs() < 1e-9);
        assert!((reading.current_rms.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn implausible_samples_drop_per_metric() {
        let config = AcquisitionConfig::default();
        let channel = channel_config(1.0, 1.0);
        let mut accumulator =
            WindowAccumulator::new(&config, &channel, ChannelOffsets::default());

        accumulator.push(RawSample {
            voltage: f64::NAN,
            current: 3.0,
        });
        accumulator.push(RawSample {
            voltage: config.adc_full_scale + 1.0,
            current: 4.0,
        });

        let reading = accumulator.finish();
        assert_eq!(reading.voltage_rms, None);
        assert_eq!(reading.voltage_samples, 0);
        assert_eq!(reading.current_samples, 2);
        let expected = ((9.0 + 16.0) / 2.0f64).sqrt();
        assert!((reading.current_rms.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn empty_window_reports_no_readings() {
        let config = AcquisitionConfig::default();
        let channel = channel_config(1.0, 1.0);
        let accumulator = WindowAccumulator::new(&config, &channel, ChannelOffsets::default());
        let reading = accumulator.finish();
        assert_eq!(reading.voltage_rms, None);
        assert_eq!(reading.current_rms, None);
    }
}
