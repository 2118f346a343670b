//! ---
//! lw_section: "03-persistence-logging"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Daily peak tracking and append-only event log."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use lw_common::timing::civil_date;
use lw_common::ChannelId;

/// Maxima recorded for one channel during the current civil day.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PeakSnapshot {
    /// Highest power seen today, watts.
    pub power_w: f64,
    /// Highest voltage seen today, volts.
    pub voltage_v: f64,
}

/// Read access to today's peaks, as consumed by the dynamic anomaly rules.
pub trait PeakStore: Send + Sync {
    /// Today's maxima for `channel`. `None` until the first observation of
    /// the civil day, which keeps peak-relative rules quiet on a fresh day
    /// instead of comparing against zero.
    fn today(&self, channel: ChannelId, now: DateTime<Utc>) -> Option<PeakSnapshot>;
}

struct PeaksInner {
    date: Option<NaiveDate>,
    channels: [Option<PeakSnapshot>; 2],
}

/// In-process per-day peak tracker.
///
/// The day boundary is midnight under a fixed UTC offset; when the civil
/// date changes all channels reset together.
pub struct DailyPeaks {
    utc_offset_hours: i8,
    inner: Mutex<PeaksInner>,
}

impl DailyPeaks {
    /// Create a tracker whose days roll over at midnight UTC+`offset`.
    pub fn new(utc_offset_hours: i8) -> Self {
        Self {
            utc_offset_hours,
            inner: Mutex::new(PeaksInner {
                date: None,
                channels: [None, None],
            }),
        }
    }

    /// Fold a reading into today's maxima. Non-finite readings are ignored.
    pub fn observe(&self, channel: ChannelId, power_w: f64, voltage_v: f64, now: DateTime<Utc>) {
        if !power_w.is_finite() || !voltage_v.is_finite() {
            return;
        }
        let date = civil_date(now, self.utc_offset_hours);
        let mut inner = self.inner.lock();
        if inner.date != Some(date) {
            if inner.date.is_some() {
                debug!(date = %date, "daily peak rollover");
            }
            inner.date = Some(date);
            inner.channels = [None, None];
        }
        let entry = inner.channels[channel.index()].get_or_insert_with(PeakSnapshot::default);
        entry.power_w = entry.power_w.max(power_w);
        entry.voltage_v = entry.voltage_v.max(voltage_v);
    }
}

impl PeakStore for DailyPeaks {
    fn today(&self, channel: ChannelId, now: DateTime<Utc>) -> Option<PeakSnapshot> {
        let date = civil_date(now, self.utc_offset_hours);
        let inner = self.inner.lock();
        if inner.date != Some(date) {
            return None;
        }
        inner.channels[channel.index()]
    }
}
