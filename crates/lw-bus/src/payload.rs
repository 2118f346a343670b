//! ---
//! lw_section: "02-messaging-telemetry-bus"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Telemetry bus topics, wire payloads and in-process broker."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Wire payloads and the single normalization boundary for inbound ones.
//!
//! Everything arriving from the bus is decoded here into canonical types
//! before any control or detection logic sees it. A payload that fails to
//! normalize is rejected whole; no partially-decoded command ever
//! propagates.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use lw_common::{ChannelId, Issuer, OperatingMode, RelayState};

/// Round to a fixed number of decimal places for wire publication.
fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Per-window readings as published on `loads/<n>/telemetry`.
///
/// Wire precision is fixed: volts to 0.1, amps to 0.001, watts to 0.1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Filtered RMS voltage, volts.
    pub voltage: f64,
    /// Filtered RMS current, amps.
    pub current: f64,
    /// Derived real power, watts.
    pub power: f64,
}

impl TelemetryPayload {
    /// Quantize filtered readings to wire precision.
    pub fn from_readings(voltage: f64, current: f64, power: f64) -> Self {
        Self {
            voltage: round_to(voltage, 1),
            current: round_to(current, 3),
            power: round_to(power, 1),
        }
    }
}

/// Relay state report as published on `loads/<n>/relay/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatusPayload {
    /// True when the relay is closed.
    pub relay_state: bool,
}

impl From<RelayState> for RelayStatusPayload {
    fn from(state: RelayState) -> Self {
        Self {
            relay_state: state.is_on(),
        }
    }
}

/// Issuer-tagged transition record as published on `system/audit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPayload {
    /// Channel that transitioned.
    pub channel: ChannelId,
    /// Resulting relay state.
    pub relay_state: bool,
    /// Who caused the transition. Never inferred, never dropped.
    pub issuer: Issuer,
    /// When the transition was applied.
    pub timestamp: DateTime<Utc>,
}

/// Ambient reading decoded from `system/environment`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity percent; 0.0 when the sender omitted it.
    #[serde(default)]
    pub humidity: f64,
}

/// Canonical relay command, the only command shape the control loop sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Target channel.
    pub channel: ChannelId,
    /// Requested relay state.
    pub desired: RelayState,
    /// Who asked. Safety outranks everything during arbitration.
    pub issuer: Issuer,
}

impl Command {
    /// Wire form for publication on `loads/<n>/relay/set`.
    pub fn wire_payload(&self) -> JsonValue {
        serde_json::json!({
            "relay_state": self.desired.is_on(),
            "issuer": self.issuer.as_str(),
        })
    }
}

/// Raised when an inbound payload fails normalization. The payload is
/// dropped and logged at the boundary; nothing downstream sees it.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Payload was not a JSON object.
    #[error("payload must be a JSON object")]
    NotAnObject,
    /// None of the accepted relay field names were present.
    #[error("missing relay field (accepted: relay_state, state, on)")]
    MissingRelayField,
    /// A recognised field carried the wrong JSON type.
    #[error("field '{0}' has the wrong type")]
    WrongType(&'static str),
    /// Unrecognised issuer tag.
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),
    /// None of the accepted mode field names were present.
    #[error("missing mode field (accepted: mode, operating_mode)")]
    MissingModeField,
    /// Unrecognised operating mode.
    #[error("unknown operating mode: {0}")]
    UnknownMode(String),
    /// Temperature missing or not a finite number.
    #[error("temperature must be a finite number")]
    BadTemperature,
}

/// Normalize a relay command addressed to `channel`.
///
/// Accepts `relay_state`, `state` or `on` as the boolean field (older
/// firmware and backends disagree on the name) and an optional `issuer`
/// of `manual`, `auto` or `safety`. A missing issuer means an operator:
/// external senders that predate the tag are always human-driven.
pub fn decode_relay_command(
    channel: ChannelId,
    payload: &JsonValue,
) -> Result<Command, PayloadError> {
    let object = payload.as_object().ok_or(PayloadError::NotAnObject)?;

    let mut desired = None;
    for key in ["relay_state", "state", "on"] {
        if let Some(value) = object.get(key) {
            let on = value.as_bool().ok_or(PayloadError::WrongType(key))?;
            desired = Some(RelayState::from(on));
            break;
        }
    }
    let desired = desired.ok_or(PayloadError::MissingRelayField)?;

    let issuer = match object.get("issuer") {
        None => Issuer::Manual,
        Some(JsonValue::String(tag)) => match tag.to_lowercase().as_str() {
            "manual" => Issuer::Manual,
            "auto" => Issuer::Auto,
            "safety" => Issuer::Safety,
            other => return Err(PayloadError::UnknownIssuer(other.to_owned())),
        },
        Some(_) => return Err(PayloadError::WrongType("issuer")),
    };

    Ok(Command {
        channel,
        desired,
        issuer,
    })
}

/// Normalize a mode command. Accepts `mode` or `operating_mode`, values
/// `auto`/`manual` in any case.
pub fn decode_mode(payload: &JsonValue) -> Result<OperatingMode, PayloadError> {
    let object = payload.as_object().ok_or(PayloadError::NotAnObject)?;
    let field = object
        .get("mode")
        .or_else(|| object.get("operating_mode"))
        .ok_or(PayloadError::MissingModeField)?;
    let tag = field.as_str().ok_or(PayloadError::WrongType("mode"))?;
    tag.parse::<OperatingMode>()
        .map_err(|_| PayloadError::UnknownMode(tag.to_owned()))
}

/// Normalize an environment reading. Humidity defaults to 0.0;
/// temperature must be present and finite.
pub fn decode_environment(payload: &JsonValue) -> Result<EnvironmentReading, PayloadError> {
    let object = payload.as_object().ok_or(PayloadError::NotAnObject)?;
    let temperature = object
        .get("temperature")
        .and_then(JsonValue::as_f64)
        .ok_or(PayloadError::BadTemperature)?;
    if !temperature.is_finite() {
        return Err(PayloadError::BadTemperature);
    }
    let humidity = object
        .get("humidity")
        .and_then(JsonValue::as_f64)
        .unwrap_or(0.0);
    Ok(EnvironmentReading {
        temperature,
        humidity,
    })
}
