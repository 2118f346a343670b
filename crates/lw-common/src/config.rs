//! ---
//! lw_section: "01-core-functionality"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Shared primitives and utilities for the LoadWatch runtime."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::types::{ChannelId, OperatingMode};

fn default_label(channel: ChannelId) -> String {
    format!("load-{}", channel)
}

fn default_cal() -> f64 {
    1.0
}

fn default_trip_power() -> f64 {
    2200.0
}

fn default_trip_voltage() -> f64 {
    253.0
}

fn default_line_hz() -> f64 {
    50.0
}

fn default_samples_per_cycle() -> u32 {
    64
}

fn default_cycles_per_window() -> u32 {
    5
}

fn default_calibration_samples() -> u32 {
    4096
}

fn default_ema_alpha() -> f64 {
    0.35
}

fn default_voltage_clamp() -> f64 {
    260.0
}

fn default_current_floor() -> f64 {
    0.05
}

fn default_adc_full_scale() -> f64 {
    4096.0
}

fn default_synthetic_seed() -> u64 {
    0xACDCu64
}

fn default_mains_voltage() -> f64 {
    230.0
}

fn default_load1_current() -> f64 {
    4.3
}

fn default_load2_current() -> f64 {
    0.6
}

fn default_noise_sd() -> f64 {
    1.5
}

fn default_temp_threshold() -> f64 {
    30.0
}

fn default_cold_channel() -> ChannelId {
    ChannelId::One
}

fn default_hot_channel() -> ChannelId {
    ChannelId::Two
}

fn default_sentinel_tick() -> Duration {
    Duration::from_secs(15)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_power_peak_ratio() -> f64 {
    0.90
}

fn default_voltage_peak_ratio() -> f64 {
    0.95
}

fn default_power_ceiling() -> f64 {
    2000.0
}

fn default_system_cap() -> f64 {
    3500.0
}

fn default_queue_depth() -> usize {
    64
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("target/loadwatch")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object for the LoadWatch runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub sentinel: SentinelConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "LW_CONFIG";

    /// Load configuration from disk, respecting the `LW_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.channels.validate()?;
        self.acquisition.validate()?;
        self.control.validate()?;
        self.sentinel.validate()?;
        self.bus.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// The two supervised load channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "ChannelConfig::default_load1")]
    pub load1: ChannelConfig,
    #[serde(default = "ChannelConfig::default_load2")]
    pub load2: ChannelConfig,
}

impl ChannelsConfig {
    /// Configuration for a channel by identity.
    pub fn get(&self, channel: ChannelId) -> &ChannelConfig {
        match channel {
            ChannelId::One => &self.load1,
            ChannelId::Two => &self.load2,
        }
    }

    /// Iterate channels in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &ChannelConfig)> {
        ChannelId::ALL.into_iter().map(move |id| (id, self.get(id)))
    }

    pub fn validate(&self) -> Result<()> {
        for (id, channel) in self.iter() {
            channel.validate(id)?;
        }
        Ok(())
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            load1: ChannelConfig::default_load1(),
            load2: ChannelConfig::default_load2(),
        }
    }
}

/// Per-channel identity, calibration and firmware safety limits.
///
/// The `trip_*` limits are absolute: they apply in every operating mode
/// and no inbound command can raise them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub label: String,
    #[serde(default = "default_cal")]
    pub voltage_cal: f64,
    #[serde(default = "default_cal")]
    pub current_cal: f64,
    #[serde(default = "default_trip_power")]
    pub trip_power_w: f64,
    #[serde(default = "default_trip_voltage")]
    pub trip_voltage_v: f64,
}

impl ChannelConfig {
    fn default_load1() -> Self {
        Self {
            label: default_label(ChannelId::One),
            voltage_cal: default_cal(),
            current_cal: default_cal(),
            trip_power_w: default_trip_power(),
            trip_voltage_v: default_trip_voltage(),
        }
    }

    fn default_load2() -> Self {
        Self {
            label: default_label(ChannelId::Two),
            ..Self::default_load1()
        }
    }

    pub fn validate(&self, channel: ChannelId) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(anyhow!("channel {} must have a label", channel));
        }
        for (name, value) in [
            ("voltage_cal", self.voltage_cal),
            ("current_cal", self.current_cal),
            ("trip_power_w", self.trip_power_w),
            ("trip_voltage_v", self.trip_voltage_v),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!(
                    "channel {} {} must be finite and positive, got {}",
                    channel,
                    name,
                    value
                ));
            }
        }
        Ok(())
    }
}

/// Sampling geometry and filter constants for the signal chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_line_hz")]
    pub line_hz: f64,
    #[serde(default = "default_samples_per_cycle")]
    pub samples_per_cycle: u32,
    #[serde(default = "default_cycles_per_window")]
    pub cycles_per_window: u32,
    #[serde(default = "default_calibration_samples")]
    pub calibration_samples: u32,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    #[serde(default = "default_voltage_clamp")]
    pub voltage_clamp_v: f64,
    #[serde(default = "default_current_floor")]
    pub current_floor_a: f64,
    #[serde(default = "default_adc_full_scale")]
    pub adc_full_scale: f64,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

impl AcquisitionConfig {
    /// Samples per measurement window: whole AC cycles only, so the RMS
    /// integration never straddles a partial cycle.
    pub fn window_samples(&self) -> u32 {
        self.samples_per_cycle * self.cycles_per_window
    }

    /// Wall-clock duration of one measurement window.
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.cycles_per_window) / self.line_hz)
    }

    /// Interval between consecutive samples.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / (self.line_hz * f64::from(self.samples_per_cycle)))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.line_hz.is_finite() || self.line_hz <= 0.0 {
            return Err(anyhow!("acquisition line_hz must be positive"));
        }
        if self.samples_per_cycle == 0 || self.cycles_per_window == 0 {
            return Err(anyhow!(
                "acquisition window must cover at least one sample of one cycle"
            ));
        }
        if self.calibration_samples == 0 {
            return Err(anyhow!("calibration_samples must be positive"));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(anyhow!(
                "ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            ));
        }
        if !self.voltage_clamp_v.is_finite() || self.voltage_clamp_v <= 0.0 {
            return Err(anyhow!("voltage_clamp_v must be positive"));
        }
        if !self.current_floor_a.is_finite() || self.current_floor_a < 0.0 {
            return Err(anyhow!("current_floor_a must be non-negative"));
        }
        if !self.adc_full_scale.is_finite() || self.adc_full_scale <= 0.0 {
            return Err(anyhow!("adc_full_scale must be positive"));
        }
        Ok(())
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            line_hz: default_line_hz(),
            samples_per_cycle: default_samples_per_cycle(),
            cycles_per_window: default_cycles_per_window(),
            calibration_samples: default_calibration_samples(),
            ema_alpha: default_ema_alpha(),
            voltage_clamp_v: default_voltage_clamp(),
            current_floor_a: default_current_floor(),
            adc_full_scale: default_adc_full_scale(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

/// Parameters for the built-in synthetic mains source, used when no real
/// ADC is wired up (bench runs, demos, tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_synthetic_seed")]
    pub seed: u64,
    #[serde(default = "default_mains_voltage")]
    pub mains_voltage_v: f64,
    #[serde(default = "default_load1_current")]
    pub load1_current_a: f64,
    #[serde(default = "default_load2_current")]
    pub load2_current_a: f64,
    #[serde(default = "default_noise_sd")]
    pub noise_sd: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: default_synthetic_seed(),
            mains_voltage_v: default_mains_voltage(),
            load1_current_a: default_load1_current(),
            load2_current_a: default_load2_current(),
            noise_sd: default_noise_sd(),
        }
    }
}

/// Relay arbitration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_temp_threshold")]
    pub temp_threshold_c: f64,
    /// Channel driven while the environment is classified cold.
    #[serde(default = "default_cold_channel")]
    pub cold_channel: ChannelId,
    /// Channel driven while the environment is classified hot.
    #[serde(default = "default_hot_channel")]
    pub hot_channel: ChannelId,
    #[serde(default)]
    pub initial_mode: OperatingMode,
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.temp_threshold_c.is_finite() {
            return Err(anyhow!("temp_threshold_c must be finite"));
        }
        if self.cold_channel == self.hot_channel {
            return Err(anyhow!(
                "cold_channel and hot_channel must name different loads"
            ));
        }
        Ok(())
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            temp_threshold_c: default_temp_threshold(),
            cold_channel: default_cold_channel(),
            hot_channel: default_hot_channel(),
            initial_mode: OperatingMode::default(),
        }
    }
}

/// Backend anomaly detector settings.
///
/// The per-channel ceilings are device-type limits owned by the detector;
/// they are independent of the firmware `trip_power_w` values and may be
/// set tighter or looser.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default = "default_sentinel_tick")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_cache_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache_ttl: Duration,
    #[serde(default = "default_power_peak_ratio")]
    pub power_peak_ratio: f64,
    #[serde(default = "default_voltage_peak_ratio")]
    pub voltage_peak_ratio: f64,
    #[serde(default = "default_power_ceiling")]
    pub load1_power_ceiling_w: f64,
    #[serde(default = "default_power_ceiling")]
    pub load2_power_ceiling_w: f64,
    #[serde(default = "default_system_cap")]
    pub system_power_cap_w: f64,
    #[serde(default)]
    pub dynamic_severity: crate::types::Severity,
    #[serde(default)]
    pub peak_reset_utc_offset_hours: i8,
}

impl SentinelConfig {
    /// Detector-side power ceiling for a channel.
    pub fn power_ceiling_w(&self, channel: ChannelId) -> f64 {
        match channel {
            ChannelId::One => self.load1_power_ceiling_w,
            ChannelId::Two => self.load2_power_ceiling_w,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() || self.cache_ttl.is_zero() {
            return Err(anyhow!("sentinel intervals must be non-zero"));
        }
        for (name, ratio) in [
            ("power_peak_ratio", self.power_peak_ratio),
            ("voltage_peak_ratio", self.voltage_peak_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(anyhow!("sentinel {} must be in (0, 1], got {}", name, ratio));
            }
        }
        for (name, value) in [
            ("load1_power_ceiling_w", self.load1_power_ceiling_w),
            ("load2_power_ceiling_w", self.load2_power_ceiling_w),
            ("system_power_cap_w", self.system_power_cap_w),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("sentinel {} must be positive, got {}", name, value));
            }
        }
        if self.peak_reset_utc_offset_hours < -12 || self.peak_reset_utc_offset_hours > 14 {
            return Err(anyhow!("peak_reset_utc_offset_hours out of range"));
        }
        Ok(())
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_sentinel_tick(),
            cache_ttl: default_cache_ttl(),
            power_peak_ratio: default_power_peak_ratio(),
            voltage_peak_ratio: default_voltage_peak_ratio(),
            load1_power_ceiling_w: default_power_ceiling(),
            load2_power_ceiling_w: default_power_ceiling(),
            system_power_cap_w: default_system_cap(),
            dynamic_severity: crate::types::Severity::Warning,
            peak_reset_utc_offset_hours: 0,
        }
    }
}

/// Telemetry bus tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_reconnect_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_backoff: Duration,
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(anyhow!("bus queue_depth must be at least 1"));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            reconnect_backoff: default_reconnect_backoff(),
        }
    }
}

/// Where durable artifacts (event log, jitter summaries) land.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: default_store_directory(),
        }
    }
}

/// Log sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_minimal_toml() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.acquisition.samples_per_cycle, 64);
        assert_eq!(config.sentinel.tick_interval, Duration::from_secs(15));
        assert_eq!(config.control.initial_mode, OperatingMode::Auto);
    }

    #[test]
    fn parses_full_sections() {
        let config: AppConfig = r#"
            [channels.load1]
            label = "heater"
            trip_power_w = 1800.0

            [channels.load2]
            label = "fan"

            [control]
            temp_threshold_c = 30.0
            cold_channel = 1
            hot_channel = 2
            initial_mode = "manual"

            [sentinel]
            tick_interval = 15
            cache_ttl = 10
            dynamic_severity = "warning"

            [bus]
            queue_depth = 16
            reconnect_backoff = 2
        "#
        .parse()
        .unwrap();
        assert_eq!(config.channels.load1.label, "heater");
        assert_eq!(config.channels.load1.trip_power_w, 1800.0);
        assert_eq!(config.control.initial_mode, OperatingMode::Manual);
        assert_eq!(config.sentinel.dynamic_severity, Severity::Warning);
        assert_eq!(config.bus.queue_depth, 16);
        assert_eq!(config.bus.reconnect_backoff, Duration::from_secs(2));
    }

    #[test]
    fn rejects_identical_cold_and_hot_channels() {
        let result = "[control]\ncold_channel = 1\nhot_channel = 1\n".parse::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_alpha_outside_unit_interval() {
        let result = "[acquisition]\nema_alpha = 1.5\n".parse::<AppConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn window_geometry_is_whole_cycles() {
        let acq = AcquisitionConfig::default();
        assert_eq!(acq.window_samples(), 320);
        assert_eq!(acq.window_duration(), Duration::from_millis(100));
    }
}
