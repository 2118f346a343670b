//! ---
//! lw_section: "04-signal-acquisition"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "ADC sources, offset calibration, RMS windows and EMA filtering."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Raw sample sources.
//!
//! The signal chain is written against [`AdcSource`] so the same window and
//! filter math runs over real converter hardware, the built-in synthetic
//! mains or a scripted bench source.
use std::collections::VecDeque;
use std::f64::consts::{PI, SQRT_2};

use rand::prelude::*;
use rand_distr::Normal;

use lw_common::config::AcquisitionConfig;
use lw_common::{ChannelId, RelayState};

use crate::AcquireError;

/// Relative scale of the current input's front-end noise. The current
/// burden network runs at a far smaller count-per-unit span than the
/// voltage divider, so the same converter noise lands two orders lower.
const CURRENT_NOISE_SCALE: f64 = 0.01;

/// One paired voltage/current conversion, in raw ADC counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Voltage input counts.
    pub voltage: f64,
    /// Current input counts.
    pub current: f64,
}

/// A pollable pair of converter inputs for one channel.
pub trait AdcSource: Send {
    /// Read the next conversion pair for `channel`.
    fn sample(&mut self, channel: ChannelId) -> RawSample;

    /// Told after every relay transition. Hardware sources ignore this;
    /// the sensor already sees the real circuit. Bench sources use it so
    /// simulated current collapses when the relay opens.
    fn relay_changed(&mut self, channel: ChannelId, state: RelayState) {
        let _ = (channel, state);
    }
}

/// Sine-wave mains source with seeded Gaussian converter noise.
///
/// Counts are centred on mid-scale with one count per volt (or amp), so
/// unit calibration factors reproduce the configured RMS levels. Current
/// only flows while the channel's relay is closed; an open relay leaves
/// nothing on the input but front-end noise, which exercises the noise
/// floor path downstream.
#[derive(Debug)]
pub struct SyntheticMains {
    rng: StdRng,
    noise: Normal<f64>,
    midpoint: f64,
    phase_step: f64,
    voltage_peak: f64,
    current_peaks: [f64; 2],
    relay_on: [bool; 2],
    phase: [f64; 2],
}

impl SyntheticMains {
    /// Build from the acquisition section. Fails when the configured noise
    /// standard deviation is negative or non-finite.
    pub fn new(config: &AcquisitionConfig) -> Result<Self, AcquireError> {
        let synthetic = &config.synthetic;
        let noise = Normal::new(0.0, synthetic.noise_sd).map_err(|err| {
            AcquireError::InvalidParameter(format!(
                "synthetic noise_sd {}: {}",
                synthetic.noise_sd, err
            ))
        })?;
        Ok(Self {
            rng: StdRng::seed_from_u64(synthetic.seed),
            noise,
            midpoint: config.adc_full_scale / 2.0,
            phase_step: 2.0 * PI / f64::from(config.samples_per_cycle),
            voltage_peak: synthetic.mains_voltage_v * SQRT_2,
            current_peaks: [
                synthetic.load1_current_a * SQRT_2,
                synthetic.load2_current_a * SQRT_2,
            ],
            relay_on: [false; 2],
            phase: [0.0; 2],
        })
    }

    fn noise_sample(&mut self) -> f64 {
        self.noise.sample(&mut self.rng)
    }
}

impl AdcSource for SyntheticMains {
    fn sample(&mut self, channel: ChannelId) -> RawSample {
        let index = channel.index();
        let wave = self.phase[index].sin();
        self.phase[index] = (self.phase[index] + self.phase_step) % (2.0 * PI);

        let voltage = self.midpoint + self.voltage_peak * wave + self.noise_sample();
        let current = if self.relay_on[index] {
            self.midpoint
                + self.current_peaks[index] * wave
                + self.noise_sample() * CURRENT_NOISE_SCALE
        } else {
            self.midpoint + self.noise_sample() * CURRENT_NOISE_SCALE
        };
        RawSample { voltage, current }
    }

    fn relay_changed(&mut self, channel: ChannelId, state: RelayState) {
        self.relay_on[channel.index()] = state.is_on();
    }
}

/// RMS levels one scripted window should present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptedWindow {
    /// Target RMS voltage, volts.
    pub voltage_rms: f64,
    /// Target RMS current, amps.
    pub current_rms: f64,
}

#[derive(Debug)]
struct ScriptChannel {
    pending: VecDeque<ScriptedWindow>,
    active: ScriptedWindow,
    produced: u32,
    phase: f64,
}

impl ScriptChannel {
    fn idle(window_samples: u32) -> Self {
        // produced starts at the boundary so the first sample call pops
        // the first queued window instead of serving an idle one
        Self {
            pending: VecDeque::new(),
            active: ScriptedWindow {
                voltage_rms: 0.0,
                current_rms: 0.0,
            },
            produced: window_samples,
            phase: 0.0,
        }
    }
}

/// Noise-free source that replays an exact per-window script.
///
/// Each queued window holds for one full measurement window; when the
/// script runs out the last window keeps repeating. Samples are pure
/// sines, so with whole-cycle windows the measured RMS matches the
/// scripted level to float precision.
#[derive(Debug)]
pub struct ScriptedSource {
    midpoint: f64,
    phase_step: f64,
    window_samples: u32,
    channels: [ScriptChannel; 2],
}

impl ScriptedSource {
    /// Build an idle source (both channels scripted at 0 V / 0 A).
    pub fn new(config: &AcquisitionConfig) -> Self {
        let window_samples = config.window_samples();
        Self {
            midpoint: config.adc_full_scale / 2.0,
            phase_step: 2.0 * PI / f64::from(config.samples_per_cycle),
            window_samples,
            channels: [
                ScriptChannel::idle(window_samples),
                ScriptChannel::idle(window_samples),
            ],
        }
    }

    /// Queue the levels for one further window on `channel`.
    pub fn enqueue(&mut self, channel: ChannelId, window: ScriptedWindow) {
        self.channels[channel.index()].pending.push_back(window);
    }

    /// Queue the same levels for `windows` consecutive windows.
    pub fn enqueue_steady(&mut self, channel: ChannelId, window: ScriptedWindow, windows: u32) {
        for _ in 0..windows {
            self.enqueue(channel, window);
        }
    }
}

impl AdcSource for ScriptedSource {
    fn sample(&mut self, channel: ChannelId) -> RawSample {
        let slot = &mut self.channels[channel.index()];
        if slot.produced >= self.window_samples {
            slot.produced = 0;
            if let Some(next) = slot.pending.pop_front() {
                slot.active = next;
            }
        }
        let wave = slot.phase.sin();
        slot.phase = (slot.phase + self.phase_step) % (2.0 * PI);
        slot.produced += 1;
        RawSample {
            voltage: self.midpoint + slot.active.voltage_rms * SQRT_2 * wave,
            current: self.midpoint + slot.active.current_rms * SQRT_2 * wave,
        }
    }
}
