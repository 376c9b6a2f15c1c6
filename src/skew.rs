//! Key frequency profiling and hot-key detection.
//!
//! A key is skewed when its record count exceeds
//! `max(factor * total_records, 5 * mean_records_per_key)`. Only the primary
//! component of a composite key is counted.

use std::collections::BTreeSet;

use bytes::Bytes;
use fnv::FnvHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::codec::FIELD_SEPARATOR;
use crate::ordering::primary_key;

pub const DEFAULT_THRESHOLD_FACTOR: f64 = 0.01;
/// How many times the mean per-key count a key must exceed.
pub const MEAN_MULTIPLIER: f64 = 5.0;
pub const TOP_KEYS: usize = 10;

/// Per-key frequencies of one stream and the hot keys derived from them.
#[derive(Debug, Clone, Default)]
pub struct SkewProfile {
    counts: FnvHashMap<Bytes, u64>,
    total_records: u64,
    threshold: f64,
    skewed_keys: BTreeSet<Bytes>,
}

/// Count key frequencies over a stream of `key<TAB>value` lines.
///
/// A line without a tab counts as a key with no value.
pub fn profile<I>(lines: I, threshold_factor: f64) -> SkewProfile
where
    I: IntoIterator<Item = Bytes>,
{
    let mut counts: FnvHashMap<Bytes, u64> = FnvHashMap::default();
    let mut total_records = 0u64;
    for line in lines {
        total_records += 1;
        let key = match line.iter().position(|&b| b == FIELD_SEPARATOR) {
            Some(pos) => line.slice(..pos),
            None => line,
        };
        *counts.entry(primary_key(&key)).or_insert(0) += 1;
    }
    SkewProfile::from_counts(counts, total_records, threshold_factor)
}

impl SkewProfile {
    pub fn from_counts(
        counts: FnvHashMap<Bytes, u64>,
        total_records: u64,
        threshold_factor: f64,
    ) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        let mean = total_records as f64 / counts.len() as f64;
        let threshold = (threshold_factor * total_records as f64).max(MEAN_MULTIPLIER * mean);
        let skewed_keys = counts
            .iter()
            .filter(|&(_, &count)| count as f64 > threshold)
            .map(|(key, _)| key.clone())
            .collect();
        Self {
            counts,
            total_records,
            threshold,
            skewed_keys,
        }
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn unique_keys(&self) -> usize {
        self.counts.len()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn count(&self, key: &[u8]) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn is_skewed(&self, key: &[u8]) -> bool {
        self.skewed_keys.contains(key)
    }

    pub fn skewed_keys(&self) -> &BTreeSet<Bytes> {
        &self.skewed_keys
    }

    /// The `limit` most frequent keys, ties broken by key.
    pub fn top_keys(&self, limit: usize) -> Vec<(Bytes, u64)> {
        self.counts
            .iter()
            .map(|(k, &c)| (k.clone(), c))
            .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            .take(limit)
            .collect()
    }

    pub fn distribution(&self) -> Option<DistributionStats> {
        let counts: Vec<u64> = self.counts.values().copied().sorted().collect();
        DistributionStats::from_sorted(&counts)
    }

    pub fn report(&self) -> SkewReport {
        let to_string = |k: &Bytes| String::from_utf8_lossy(k).into_owned();
        let skewed_keys: Vec<String> = self.skewed_keys.iter().map(to_string).collect();
        SkewReport {
            total_records: self.total_records,
            unique_keys: self.unique_keys(),
            average_records_per_key: if self.counts.is_empty() {
                0.0
            } else {
                self.total_records as f64 / self.counts.len() as f64
            },
            skew_threshold: self.threshold,
            skewed_keys_count: skewed_keys.len(),
            skewed_keys,
            top_keys: self
                .top_keys(TOP_KEYS)
                .into_iter()
                .map(|(k, c)| (to_string(&k), c))
                .collect(),
            distribution_stats: self.distribution(),
        }
    }
}

/// The structured skew report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkewReport {
    pub total_records: u64,
    pub unique_keys: usize,
    pub average_records_per_key: f64,
    pub skew_threshold: f64,
    pub skewed_keys: Vec<String>,
    pub skewed_keys_count: usize,
    pub top_keys: Vec<(String, u64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_stats: Option<DistributionStats>,
}

/// Order statistics of the per-key counts. Reported only; routing never
/// depends on these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionStats {
    pub min: u64,
    pub max: u64,
    pub median: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl DistributionStats {
    fn from_sorted(sorted: &[u64]) -> Option<Self> {
        let (&min, &max) = (sorted.first()?, sorted.last()?);
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<u64>() as f64 / n;
        let variance = sorted
            .iter()
            .map(|&c| (c as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        Some(Self {
            min,
            max,
            median: percentile(sorted, 50.0),
            mean,
            std_dev: variance.sqrt(),
            p90: percentile(sorted, 90.0),
            p95: percentile(sorted, 95.0),
            p99: percentile(sorted, 99.0),
        })
    }
}

/// Percentile of sorted values with linear interpolation between the two
/// closest ranks. Zero for an empty slice.
pub fn percentile(sorted: &[u64], pct: f64) -> f64 {
    let Some(&last) = sorted.last() else {
        return 0.0;
    };
    if sorted.len() == 1 {
        return last as f64;
    }
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let (Some(&lo), Some(&hi)) = (sorted.get(lower), sorted.get(upper)) else {
        return last as f64;
    };
    lo as f64 + (hi as f64 - lo as f64) * (rank - lower as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(keys: &[&str]) -> Vec<Bytes> {
        keys.iter().map(|k| Bytes::from(format!("{k}\tv"))).collect()
    }

    #[test]
    fn empty_stream_has_zero_threshold() {
        let p = profile(Vec::new(), DEFAULT_THRESHOLD_FACTOR);
        assert_eq!(p.threshold(), 0.0);
        assert!(p.skewed_keys().is_empty());
        let report = p.report();
        assert_eq!(report.total_records, 0);
        assert_eq!(report.average_records_per_key, 0.0);
        assert!(report.distribution_stats.is_none());
    }

    #[test]
    fn hot_key_exceeds_both_thresholds() {
        // 60 records for "hot", one each for 19 others: mean 79/20, 5x = 19.75.
        let mut keys = vec!["hot"; 60];
        let others: Vec<String> = (0..19).map(|i| format!("u{i}")).collect();
        keys.extend(others.iter().map(String::as_str));
        let p = profile(lines(&keys), DEFAULT_THRESHOLD_FACTOR);
        assert_eq!(p.total_records(), 79);
        assert_eq!(p.unique_keys(), 20);
        assert!((p.threshold() - 19.75).abs() < 1e-9);
        assert_eq!(
            p.skewed_keys().iter().cloned().collect::<Vec<_>>(),
            vec![Bytes::from("hot")]
        );
        assert_eq!(p.top_keys(1), vec![(Bytes::from("hot"), 60)]);
    }

    #[test]
    fn composite_keys_count_their_primary_component() {
        let p = profile(lines(&["u1,0000000001", "u1,0000000002", "u2"]), 0.01);
        assert_eq!(p.count(b"u1"), 2);
        assert_eq!(p.count(b"u2"), 1);
    }

    #[test]
    fn percentile_interpolates_like_numpy() {
        let v = [1, 2, 3, 4];
        assert_eq!(percentile(&v, 50.0), 2.5);
        assert!((percentile(&v, 90.0) - 3.7).abs() < 1e-9);
        assert_eq!(percentile(&[7], 99.0), 7.0);
        assert_eq!(percentile(&[], 90.0), 0.0);
    }

    #[test]
    fn report_serializes_expected_fields() {
        let p = profile(lines(&["a", "a", "b"]), 0.01);
        let json = serde_json::to_value(p.report()).unwrap();
        for field in [
            "total_records",
            "unique_keys",
            "average_records_per_key",
            "skew_threshold",
            "skewed_keys",
            "skewed_keys_count",
            "top_keys",
            "distribution_stats",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["distribution_stats"]["max"], 2);
        assert_eq!(json["top_keys"][0][0], "a");
    }
}
