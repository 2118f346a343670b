//! ---
//! lw_section: "02-messaging-telemetry-bus"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Telemetry bus topics, wire payloads and in-process broker."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
//! Per-client link state.
//!
//! A severed link models a broker outage from one client's point of view:
//! its publishes fail and deliveries addressed to it are skipped. Nothing
//! is queued on its behalf, so a restored link resumes from "now" with no
//! backlog to replay.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

/// Connection state owned by one [`crate::BusClient`].
#[derive(Debug)]
pub struct LinkState {
    client: String,
    connected: AtomicBool,
    outages: AtomicU64,
}

impl LinkState {
    pub(crate) fn new(client: String) -> Self {
        Self {
            client,
            connected: AtomicBool::new(true),
            outages: AtomicU64::new(0),
        }
    }

    /// Name of the owning client.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// True while the link is up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of outage windows this link has seen.
    pub fn outage_count(&self) -> u64 {
        self.outages.load(Ordering::Relaxed)
    }

    fn sever(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.outages.fetch_add(1, Ordering::Relaxed);
            info!(client = %self.client, "bus link severed");
        }
    }

    fn restore(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!(client = %self.client, "bus link restored");
        }
    }

    /// Poll until the link is up again, sleeping `backoff` between
    /// attempts. The backoff is fixed: reconnection is not adaptive.
    pub async fn wait_connected(&self, backoff: Duration) {
        while !self.is_connected() {
            debug!(client = %self.client, backoff_ms = backoff.as_millis() as u64, "link down; retrying");
            sleep(backoff).await;
        }
    }
}

/// Fault-injection handle over a client's link, used by tests and chaos
/// tooling to open and close outage windows.
#[derive(Debug, Clone)]
pub struct LinkFault {
    link: Arc<LinkState>,
}

impl LinkFault {
    pub(crate) fn new(link: Arc<LinkState>) -> Self {
        Self { link }
    }

    /// Begin an outage window.
    pub fn sever(&self) {
        self.link.sever();
    }

    /// End the outage window; the next reconnect attempt succeeds.
    pub fn restore(&self) {
        self.link.restore();
    }

    /// True while an outage window is open.
    pub fn is_severed(&self) -> bool {
        !self.link.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sever_and_restore_toggle_state() {
        let link = Arc::new(LinkState::new("meter".into()));
        let fault = LinkFault::new(link.clone());
        assert!(link.is_connected());

        fault.sever();
        assert!(fault.is_severed());
        assert!(!link.is_connected());
        // repeated sever is one outage window
        fault.sever();
        assert_eq!(link.outage_count(), 1);

        fault.restore();
        assert!(link.is_connected());
        fault.sever();
        assert_eq!(link.outage_count(), 2);
    }

    #[tokio::test]
    async fn wait_connected_returns_after_restore() {
        let link = Arc::new(LinkState::new("backend".into()));
        let fault = LinkFault::new(link.clone());
        fault.sever();

        let waiter = {
            let link = link.clone();
            tokio::spawn(async move { link.wait_connected(Duration::from_millis(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        fault.restore();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
