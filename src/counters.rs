//! Named counters reported by transforms and by the executor.
//!
//! A [`Counters`] is created per stage, handed to the transform through its
//! [`TaskContext`](crate::transform::TaskContext), and merged into the job's
//! and then the run's accumulator. Counters are keyed by `(category, name)`,
//! e.g. `("DataQuality", "missing_fields")`.
//!
//! Sums and gauges are kept apart: sums add up on merge, gauges keep the
//! largest observed value (peak memory, thresholds). A key is either a sum or
//! a gauge, never both; once a key has been recorded as a gauge every later
//! observation of it is folded in with `max`.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Serialize, Serializer};

/// Prefix of a counter line on the diagnostic channel.
pub const REPORTER_PREFIX: &str = "reporter:counter:";

pub const DATA_QUALITY: &str = "DataQuality";
pub const PERFORMANCE: &str = "PerformanceMetrics";
pub const FRAMEWORK: &str = "Framework";
pub const TOTAL_DISCARDED: &str = "total_discarded";

pub const PEAK_MEMORY_MB: &str = "PeakMemoryMB";
pub const RECORDS_PER_SEC: &str = "RecordsPerSec";

/// Counter lines from external transforms that carry a peak, not a delta.
const GAUGE_LINES: &[(&str, &str)] = &[(PERFORMANCE, PEAK_MEMORY_MB), (PERFORMANCE, RECORDS_PER_SEC)];

type CounterKey = (String, String);

/// Snapshot shape: category -> name -> value.
pub type CounterSnapshot = BTreeMap<String, BTreeMap<String, i64>>;

#[derive(Debug, Default, Clone)]
pub struct Counters {
    sums: DashMap<CounterKey, i64>,
    gauges: DashMap<CounterKey, i64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `by` to a summed counter. On a key already held as a gauge the
    /// value is an observation instead.
    pub fn incr(&self, category: &str, name: &str, by: i64) {
        let key = (category.to_string(), name.to_string());
        if let Some(mut peak) = self.gauges.get_mut(&key) {
            *peak = (*peak).max(by);
            return;
        }
        *self.sums.entry(key).or_insert(0) += by;
    }

    /// Record a gauge. Repeated observations keep the largest value. A sum
    /// already held under the same key is converted and folded in.
    pub fn gauge(&self, category: &str, name: &str, value: i64) {
        let key = (category.to_string(), name.to_string());
        let value = match self.sums.remove(&key) {
            Some((_, summed)) => summed.max(value),
            None => value,
        };
        self.gauges
            .entry(key)
            .and_modify(|v| *v = (*v).max(value))
            .or_insert(value);
    }

    /// Current value of a counter or gauge, zero when never touched.
    pub fn get(&self, category: &str, name: &str) -> i64 {
        let key = (category.to_string(), name.to_string());
        self.gauges
            .get(&key)
            .or_else(|| self.sums.get(&key))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn merge(&self, other: &Counters) {
        for entry in other.sums.iter() {
            let (category, name) = entry.key();
            self.incr(category, name, *entry.value());
        }
        for entry in other.gauges.iter() {
            let (category, name) = entry.key();
            self.gauge(category, name, *entry.value());
        }
    }

    /// Ordered copy of every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        let mut out = CounterSnapshot::new();
        for entry in self.sums.iter().chain(self.gauges.iter()) {
            let (category, name) = entry.key();
            out.entry(category.clone())
                .or_default()
                .insert(name.clone(), *entry.value());
        }
        out
    }

    /// Render as `reporter:counter:Category,name,value` lines.
    pub fn reporter_lines(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .flat_map(|(category, names)| {
                names.into_iter().map(move |(name, value)| {
                    format!("{REPORTER_PREFIX}{category},{name},{value}")
                })
            })
            .collect()
    }

    /// Parse a diagnostic line emitted by an external transform. Returns
    /// `false` when the line is not a counter line.
    pub fn absorb_reporter_line(&self, line: &str) -> bool {
        let Some(rest) = line.trim_end().strip_prefix(REPORTER_PREFIX) else {
            return false;
        };
        let mut parts = rest.rsplitn(2, ',');
        let (Some(value), Some(head)) = (parts.next(), parts.next()) else {
            return false;
        };
        let Some((category, name)) = head.split_once(',') else {
            return false;
        };
        let Ok(value) = value.parse::<i64>() else {
            return false;
        };
        if GAUGE_LINES.iter().any(|&(c, n)| c == category && n == name) {
            self.gauge(category, name, value);
        } else {
            self.incr(category, name, value);
        }
        true
    }
}

impl Serialize for Counters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}
