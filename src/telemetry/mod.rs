//! Telemetry collection for the control loop.
//!
//! Named series of per-tick values, each held in a bounded ring buffer
//! (oldest dropped at capacity, O(1) append), saved on demand as CSV with
//! deterministically ordered columns. A per-series summary export carries
//! min/max/mean stats for quick post-run inspection.

use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
};

use log::info;
use serde::Serialize;

/// Default points retained per series.
pub const DEFAULT_CAPACITY: usize = 50_000;

/// Statistics summary for one series.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    series: &'a str,
    count: usize,
    min: f64,
    max: f64,
    mean: f64,
}

/// Appends value to a bounded buffer; drops the oldest point at capacity.
#[inline]
fn push_capped(buf: &mut VecDeque<f64>, capacity: usize, val: f64) {
    if buf.len() >= capacity {
        buf.pop_front();
    }
    buf.push_back(val);
}

/// Bounded multi-series telemetry log. Series are keyed by name; the
/// BTreeMap keeps export column order deterministic regardless of the
/// order series first appeared.
pub struct TelemetryLog {
    capacity: usize,
    series: BTreeMap<String, VecDeque<f64>>,
}

impl TelemetryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            series: BTreeMap::new(),
        }
    }

    /// Append one value to a named series, creating the series on first
    /// use.
    pub fn record(&mut self, name: &str, value: f64) {
        if let Some(buf) = self.series.get_mut(name) {
            push_capped(buf, self.capacity, value);
        } else {
            let mut buf = VecDeque::new();
            buf.push_back(value);
            self.series.insert(name.to_owned(), buf);
        }
    }

    pub fn series(&self, name: &str) -> Option<&VecDeque<f64>> {
        self.series.get(name)
    }

    pub fn series_names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Min/max/mean over one series.
    pub fn stats(&self, name: &str) -> Option<Stats> {
        let data = self.series.get(name)?;
        if data.is_empty() {
            return None;
        }
        let count = data.len();
        let min = data.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mean = data.iter().sum::<f64>() / count as f64;
        Some(Stats {
            min,
            max,
            mean,
            count,
        })
    }

    /// Write every series to one CSV file: header row of series names in
    /// key order, then index-aligned value rows. Shorter series leave
    /// their trailing cells empty.
    pub fn save(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.series.keys())?;

        let rows = self.series.values().map(VecDeque::len).max().unwrap_or(0);
        for i in 0..rows {
            let row: Vec<String> = self
                .series
                .values()
                .map(|buf| buf.get(i).map(|v| format!("{v:.6}")).unwrap_or_default())
                .collect();
            writer.write_record(&row)?;
        }
        writer.flush()?;
        info!("telemetry log saved to {}", path.display());
        Ok(())
    }

    /// Write one stats row per series (series, count, min, max, mean).
    pub fn save_summary(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for name in self.series.keys() {
            if let Some(stats) = self.stats(name) {
                writer.serialize(SummaryRow {
                    series: name,
                    count: stats.count,
                    min: stats.min,
                    max: stats.max,
                    mean: stats.mean,
                })?;
            }
        }
        writer.flush()?;
        info!("telemetry summary saved to {}", path.display());
        Ok(())
    }
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
