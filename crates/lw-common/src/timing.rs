//! ---
//! lw_section: "01-core-functionality"
//! lw_subsection: "module"
//! lw_type: "source"
//! lw_scope: "code"
//! lw_description: "Shared primitives and utilities for the LoadWatch runtime."
//! lw_version: "v0.0.0-prealpha"
//! lw_owner: "tbd"
//! ---
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Civil date under a fixed UTC offset. Daily rollovers (peak resets)
/// happen when this value changes, so the offset decides which wall clock
/// "midnight" means.
pub fn civil_date(now: DateTime<Utc>, utc_offset_hours: i8) -> NaiveDate {
    (now + chrono::Duration::hours(i64::from(utc_offset_hours))).date_naive()
}

/// Running jitter statistics for a periodic loop.
#[derive(Debug, Default)]
pub struct JitterHistogram {
    samples: Mutex<Vec<f64>>,
}

impl JitterHistogram {
    pub fn record(&self, jitter: Duration) {
        let nanos = jitter.as_secs_f64() * 1_000_000_000.0;
        self.samples.lock().push(nanos);
    }

    pub fn summary(&self) -> Option<JitterSummary> {
        let samples = self.samples.lock();
        let slice = samples.as_slice();
        if slice.is_empty() {
            return None;
        }
        let count = slice.len() as f64;
        let mean = slice.iter().sum::<f64>() / count;
        let variance = if slice.len() > 1 {
            let sum_sq = slice
                .iter()
                .map(|value| {
                    let delta = value - mean;
                    delta * delta
                })
                .sum::<f64>();
            sum_sq / (count - 1.0)
        } else {
            0.0
        };
        let max = slice.iter().copied().fold(f64::MIN, f64::max);
        let min = slice.iter().copied().fold(f64::MAX, f64::min);
        Some(JitterSummary {
            mean_ns: mean,
            std_dev_ns: variance.sqrt(),
            max_ns: max,
            min_ns: min,
            samples: slice.len() as u64,
        })
    }

    /// Persist the summary as pretty JSON, for offline review of a run.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        if let Some(summary) = self.summary() {
            let mut file = File::create(path)?;
            let json = serde_json::to_vec_pretty(&summary)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
            file.write_all(&json)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct JitterSummary {
    pub mean_ns: f64,
    pub std_dev_ns: f64,
    pub max_ns: f64,
    pub min_ns: f64,
    pub samples: u64,
}

/// Measures tick intervals of a loop against its target period.
#[derive(Debug)]
pub struct LoopTimingReporter {
    target_interval: Duration,
    last_tick: Mutex<Option<Instant>>,
    histogram: JitterHistogram,
}

impl LoopTimingReporter {
    pub fn new(target_interval: Duration) -> Self {
        Self {
            target_interval,
            last_tick: Mutex::new(None),
            histogram: JitterHistogram::default(),
        }
    }

    pub fn record_tick(&self) {
        let mut last_tick = self.last_tick.lock();
        let now = Instant::now();
        if let Some(previous) = *last_tick {
            let actual = now.duration_since(previous);
            let jitter = if actual > self.target_interval {
                actual - self.target_interval
            } else {
                self.target_interval - actual
            };
            self.histogram.record(jitter);
        }
        *last_tick = Some(now);
    }

    pub fn histogram(&self) -> &JitterHistogram {
        &self.histogram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn civil_date_respects_offset() {
        let half_past_seven_utc = Utc.with_ymd_and_hms(2024, 3, 10, 19, 30, 0).unwrap();
        assert_eq!(
            civil_date(half_past_seven_utc, 0),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
        // +5h pushes the clock past local midnight.
        assert_eq!(
            civil_date(half_past_seven_utc, 5),
            NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
        );
        // 02:00 UTC is still the previous day at -12h.
        assert_eq!(
            civil_date(Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(), -12),
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
        );
    }

    #[test]
    fn histogram_summarises_samples() {
        let histogram = JitterHistogram::default();
        assert!(histogram.summary().is_none());
        histogram.record(Duration::from_micros(100));
        histogram.record(Duration::from_micros(300));
        let summary = histogram.summary().unwrap();
        assert_eq!(summary.samples, 2);
        assert!((summary.mean_ns - 200_000.0).abs() < 1.0);
        assert!(summary.max_ns >= summary.min_ns);
    }

    #[test]
    fn reporter_needs_two_ticks_for_a_sample() {
        let reporter = LoopTimingReporter::new(Duration::from_millis(10));
        reporter.record_tick();
        assert!(reporter.histogram().summary().is_none());
        reporter.record_tick();
        assert_eq!(reporter.histogram().summary().unwrap().samples, 1);
    }

    #[test]
    fn summary_writes_json() {
        let histogram = JitterHistogram::default();
        histogram.record(Duration::from_micros(50));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jitter.json");
        histogram.write_json(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("mean_ns"));
    }
}
