//! ---
//! lw_section: "01-core-functionality"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Shared primitives and utilities for the LoadWatch runtime."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one of the two supervised AC load channels.
///
/// Channels are numbered 1 and 2 on the wire and in configuration files;
/// the enum keeps accidental third channels unrepresentable.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChannelId {
    /// Load channel 1.
    One,
    /// Load channel 2.
    Two,
}

impl ChannelId {
    /// Both channels, in wire order.
    pub const ALL: [ChannelId; 2] = [ChannelId::One, ChannelId::Two];

    /// Zero-based index, for per-channel arrays.
    pub fn index(self) -> usize {
        match self {
            ChannelId::One => 0,
            ChannelId::Two => 1,
        }
    }

    /// One-based wire number.
    pub fn number(self) -> u8 {
        match self {
            ChannelId::One => 1,
            ChannelId::Two => 2,
        }
    }

    /// The other channel of the pair.
    pub fn peer(self) -> ChannelId {
        match self {
            ChannelId::One => ChannelId::Two,
            ChannelId::Two => ChannelId::One,
        }
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChannelId::One),
            2 => Ok(ChannelId::Two),
            other => Err(format!("unknown load channel: {}", other)),
        }
    }
}

impl From<ChannelId> for u8 {
    fn from(value: ChannelId) -> Self {
        value.number()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Commanded or reported state of a load relay.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    /// Relay open, load unpowered.
    #[default]
    Off,
    /// Relay closed, load powered.
    On,
}

impl RelayState {
    /// True when the relay is closed.
    pub fn is_on(self) -> bool {
        matches!(self, RelayState::On)
    }
}

impl From<bool> for RelayState {
    fn from(on: bool) -> Self {
        if on {
            RelayState::On
        } else {
            RelayState::Off
        }
    }
}

impl From<RelayState> for bool {
    fn from(state: RelayState) -> Self {
        state.is_on()
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::Off => write!(f, "off"),
            RelayState::On => write!(f, "on"),
        }
    }
}

/// Global operating mode of the relay control loop.
///
/// The mode is process-wide: both channels follow it together. In `Auto`
/// the temperature rule drives the relays and operator commands are
/// ignored; in `Manual` the rule is suspended and operator commands are
/// honoured. Safety enforcement runs in either mode.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Temperature rule in charge.
    #[default]
    Auto,
    /// Operator commands in charge.
    Manual,
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(OperatingMode::Auto),
            "manual" => Ok(OperatingMode::Manual),
            other => Err(format!("unknown operating mode: {}", other)),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Auto => write!(f, "auto"),
            OperatingMode::Manual => write!(f, "manual"),
        }
    }
}

/// Origin of a relay transition. The tag travels with every command,
/// status record and audit entry so downstream consumers can always tell
/// operator action, automatic control and protection apart.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Issuer {
    /// An operator or backend acting on the operator's behalf.
    Manual,
    /// The automatic temperature rule.
    Auto,
    /// Safety enforcement, firmware- or detector-side. Highest precedence.
    Safety,
}

impl Issuer {
    /// Stable lowercase name, used for metric labels and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Issuer::Manual => "manual",
            Issuer::Auto => "auto",
            Issuer::Safety => "safety",
        }
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to anomaly events.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Condition worth surfacing; no automatic action implied by itself.
    #[default]
    Warning,
    /// Condition that triggered protective action.
    Critical,
}

impl Severity {
    /// Stable lowercase name, used for metric labels and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
