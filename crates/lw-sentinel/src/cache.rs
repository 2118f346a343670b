//! ---
//! lw_section: "06-anomaly-detection"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "TTL snapshot cache of the latest telemetry per channel."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use lw_acquire::TelemetrySample;
use lw_common::{ChannelId, RelayState};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct CacheInner {
    samples: [Option<TelemetrySample>; 2],
    relays: [RelayState; 2],
}

/// Latest known telemetry per channel, with bounded staleness.
///
/// The ingest task writes, the detector tick reads. An entry older than
/// the TTL is treated as absent rather than an error: on a lossy bus a
/// quiet channel is ordinary, and the detector simply has nothing to say
/// about it until fresh telemetry arrives.
#[derive(Debug)]
pub struct SnapshotCache {
    ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl SnapshotCache {
    /// Cache whose entries expire `ttl` after their sample timestamp.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Store the newest sample for its channel, replacing any previous one.
    pub fn insert(&self, sample: TelemetrySample) {
        let mut inner = self.inner.lock();
        inner.samples[sample.channel.index()] = Some(sample);
    }

    /// Record a relay status report.
    ///
    /// The state is remembered for composing future samples and patched
    /// onto the cached sample, so a status arriving between telemetry
    /// windows is visible to the next evaluation.
    pub fn set_relay(&self, channel: ChannelId, state: RelayState) {
        let mut inner = self.inner.lock();
        inner.relays[channel.index()] = state;
        if let Some(sample) = inner.samples[channel.index()].as_mut() {
            sample.relay_state = state;
        }
    }

    /// Last reported relay state for a channel; `Off` until the first report.
    pub fn relay(&self, channel: ChannelId) -> RelayState {
        self.inner.lock().relays[channel.index()]
    }

    /// The channel's cached sample, if one exists and is still fresh at `now`.
    pub fn latest(&self, channel: ChannelId, now: DateTime<Utc>) -> Option<TelemetrySample> {
        let inner = self.inner.lock();
        let sample = inner.samples[channel.index()].as_ref()?;
        let age = now.signed_duration_since(sample.timestamp);
        // Future-stamped samples count as fresh.
        if age > chrono::Duration::zero() && age.to_std().map_or(true, |age| age > self.ttl) {
            return None;
        }
        Some(sample.clone())
    }
}
