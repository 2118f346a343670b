//! ---
//! lw_section: "02-messaging-telemetry-bus"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Telemetry bus topics, wire payloads and in-process broker."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Deterministic message-loss and duplication injection.
//!
//! The bus is allowed to lose and to duplicate: consumers must treat every
//! payload as a self-contained snapshot. A [`ChaosPolicy`] installed on the
//! broker exercises exactly that contract in tests and soak runs.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Declarative loss/duplication policy, counted across all publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaosPolicy {
    /// Drop every nth published message. `None` or `Some(0)` disables.
    #[serde(default)]
    pub drop_every_nth: Option<u64>,
    /// Deliver every nth published message twice. `None` or `Some(0)`
    /// disables. Drop wins when both hit the same message.
    #[serde(default)]
    pub duplicate_every_nth: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChaosDecision {
    Deliver,
    Drop,
    Duplicate,
}

#[derive(Debug)]
pub(crate) struct ChaosState {
    policy: ChaosPolicy,
    publishes: AtomicU64,
}

impl ChaosState {
    pub(crate) fn new(policy: ChaosPolicy) -> Self {
        Self {
            policy,
            publishes: AtomicU64::new(0),
        }
    }

    pub(crate) fn decide(&self) -> ChaosDecision {
        let n = self.publishes.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(every) = self.policy.drop_every_nth.filter(|every| *every > 0) {
            if n % every == 0 {
                return ChaosDecision::Drop;
            }
        }
        if let Some(every) = self.policy.duplicate_every_nth.filter(|every| *every > 0) {
            if n % every == 0 {
                return ChaosDecision::Duplicate;
            }
        }
        ChaosDecision::Deliver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_always_delivers() {
        let state = ChaosState::new(ChaosPolicy::default());
        for _ in 0..10 {
            assert_eq!(state.decide(), ChaosDecision::Deliver);
        }
    }

    #[test]
    fn drops_every_nth_publish() {
        let state = ChaosState::new(ChaosPolicy {
            drop_every_nth: Some(3),
            duplicate_every_nth: None,
        });
        let decisions: Vec<_> = (0..6).map(|_| state.decide()).collect();
        assert_eq!(
            decisions,
            vec![
                ChaosDecision::Deliver,
                ChaosDecision::Deliver,
                ChaosDecision::Drop,
                ChaosDecision::Deliver,
                ChaosDecision::Deliver,
                ChaosDecision::Drop,
            ]
        );
    }

    #[test]
    fn drop_outranks_duplicate_on_collision() {
        let state = ChaosState::new(ChaosPolicy {
            drop_every_nth: Some(2),
            duplicate_every_nth: Some(2),
        });
        assert_eq!(state.decide(), ChaosDecision::Deliver);
        assert_eq!(state.decide(), ChaosDecision::Drop);
    }

    #[test]
    fn zero_means_disabled() {
        let state = ChaosState::new(ChaosPolicy {
            drop_every_nth: Some(0),
            duplicate_every_nth: Some(1),
        });
        assert_eq!(state.decide(), ChaosDecision::Duplicate);
    }
}
