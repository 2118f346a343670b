//! ---
//! lw_section: "02-messaging-telemetry-bus"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Telemetry bus topics, wire payloads and in-process broker."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use lw_common::ChannelId;

/// Typed bus topics.
///
/// Canonical string forms:
/// `loads/<n>/telemetry`, `loads/<n>/relay/status`, `loads/<n>/relay/set`,
/// `system/mode`, `system/environment`, `system/audit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// Per-window readings for one channel.
    Telemetry(ChannelId),
    /// Relay state reports for one channel.
    RelayStatus(ChannelId),
    /// Inbound relay commands for one channel.
    RelayControl(ChannelId),
    /// Global operating mode commands.
    Mode,
    /// Ambient temperature/humidity readings.
    Environment,
    /// Issuer-tagged transition records.
    Audit,
}

impl Topic {
    /// The channel this topic addresses, if it is channel-scoped.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Topic::Telemetry(channel) | Topic::RelayStatus(channel) | Topic::RelayControl(channel) => {
                Some(*channel)
            }
            Topic::Mode | Topic::Environment | Topic::Audit => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Telemetry(channel) => write!(f, "loads/{}/telemetry", channel),
            Topic::RelayStatus(channel) => write!(f, "loads/{}/relay/status", channel),
            Topic::RelayControl(channel) => write!(f, "loads/{}/relay/set", channel),
            Topic::Mode => write!(f, "system/mode"),
            Topic::Environment => write!(f, "system/environment"),
            Topic::Audit => write!(f, "system/audit"),
        }
    }
}

/// Raised when a topic string does not match any canonical form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topic: {0}")]
pub struct TopicParseError(pub String);

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system/mode" => return Ok(Topic::Mode),
            "system/environment" => return Ok(Topic::Environment),
            "system/audit" => return Ok(Topic::Audit),
            _ => {}
        }
        let segments: Vec<&str> = s.split('/').collect();
        let channel = match segments.as_slice() {
            ["loads", number, ..] => number
                .parse::<u8>()
                .ok()
                .and_then(|n| ChannelId::try_from(n).ok()),
            _ => None,
        };
        let Some(channel) = channel else {
            return Err(TopicParseError(s.to_owned()));
        };
        match &segments[2..] {
            ["telemetry"] => Ok(Topic::Telemetry(channel)),
            ["relay", "status"] => Ok(Topic::RelayStatus(channel)),
            ["relay", "set"] => Ok(Topic::RelayControl(channel)),
            _ => Err(TopicParseError(s.to_owned())),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_round_trip() {
        let topics = [
            Topic::Telemetry(ChannelId::One),
            Topic::RelayStatus(ChannelId::Two),
            Topic::RelayControl(ChannelId::One),
            Topic::Mode,
            Topic::Environment,
            Topic::Audit,
        ];
        for topic in topics {
            let name = topic.to_string();
            assert_eq!(name.parse::<Topic>().unwrap(), topic, "{}", name);
        }
    }

    #[test]
    fn expected_wire_names() {
        assert_eq!(Topic::Telemetry(ChannelId::One).to_string(), "loads/1/telemetry");
        assert_eq!(
            Topic::RelayControl(ChannelId::Two).to_string(),
            "loads/2/relay/set"
        );
        assert_eq!(Topic::Audit.to_string(), "system/audit");
    }

    #[test]
    fn rejects_unknown_names() {
        for bad in ["loads/3/telemetry", "loads/one/telemetry", "loads/1/relay", "system/metrics", ""] {
            assert!(bad.parse::<Topic>().is_err(), "{}", bad);
        }
    }

    #[test]
    fn channel_accessor_matches_scope() {
        assert_eq!(
            Topic::Telemetry(ChannelId::Two).channel(),
            Some(ChannelId::Two)
        );
        assert_eq!(Topic::Mode.channel(), None);
    }

    #[test]
    fn serde_uses_canonical_strings() {
        let json = serde_json::to_string(&Topic::RelayStatus(ChannelId::One)).unwrap();
        assert_eq!(json, "\"loads/1/relay/status\"");
        let parsed: Topic = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Topic::RelayStatus(ChannelId::One));
    }
}
