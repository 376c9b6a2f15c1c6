//! Content items whose engagement (likes plus shares) reaches a threshold.
//!
//! The threshold comes from `TRENDING_THRESHOLD`, or is the 90th percentile
//! of all engagement counts when that is unset or negative.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use fnv::FnvHashMap;
use itertools::Itertools;
use tracing::info;

use crate::codec;
use crate::error::RecordFormatError;
use crate::skew::percentile;
use crate::transform::{GroupedReduce, Lines, StreamTransform, TaskContext};
use crate::Workload;

pub const TRENDING_STATS: &str = "TrendingStats";
pub const PERCENTILE: f64 = 90.0;

pub fn workload() -> Workload {
    Workload::new(
        Arc::new(StreamTransform::new("trending-map", map)),
        Arc::new(StreamTransform::new("trending-reduce", reduce)),
    )
    .with_combine(Arc::new(GroupedReduce::new("trending-combine", TRENDING_STATS, combine)))
}

fn engagement(raw: &[u8]) -> Result<u64, RecordFormatError> {
    let text = String::from_utf8_lossy(raw);
    text.trim().parse().map_err(|err| RecordFormatError::Unparsable {
        field: "engagement count",
        reason: format!("`{text}`: {err}"),
    })
}

/// Input: cleansed lines. Emits `content<TAB>engagement` once per content
/// item that was liked or shared.
pub fn map(input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
    let mut engagement: FnvHashMap<String, u64> = FnvHashMap::default();
    for line in input {
        let text = String::from_utf8_lossy(&line);
        let fields = codec::fields(text.trim());
        let [_, _, action, content, ..] = fields[..] else {
            let cause = RecordFormatError::TooFewFields {
                expected: 4,
                found: fields.len(),
            };
            ctx.reject(TRENDING_STATS, "missing_fields", &line, cause);
            continue;
        };
        if matches!(action.to_lowercase().as_str(), "like" | "share") {
            *engagement.entry(content.to_string()).or_default() += 1;
        }
    }
    for (content, count) in engagement {
        ctx.emit(content, count.to_string());
    }
    Ok(())
}

/// Sums the engagement of each content item.
pub fn combine(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    ctx: &mut TaskContext<'_>,
) -> Result<()> {
    let mut total = 0u64;
    for value in values {
        match engagement(&value) {
            Ok(n) => total += n,
            Err(err) => ctx.reject(TRENDING_STATS, "malformed_count", &value, err),
        }
    }
    ctx.emit(key, total.to_string());
    Ok(())
}

/// Needs the whole stream before it can emit anything.
pub fn reduce(input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
    let mut items: Vec<(Bytes, u64)> = Vec::new();
    for line in input {
        let parsed = codec::decode(&line)
            .map_err(anyhow::Error::from)
            .and_then(|kv| Ok((kv.key(), engagement(&kv.value)?)));
        match parsed {
            Ok(item) => items.push(item),
            Err(err) => ctx.reject(TRENDING_STATS, "malformed_record", &line, format!("{err:#}")),
        }
    }

    let threshold = match ctx.env().trending_threshold()? {
        Some(fixed) => fixed,
        None => {
            let sorted: Vec<u64> = items.iter().map(|(_, n)| *n).sorted().collect();
            percentile(&sorted, PERCENTILE)
        }
    };
    info!(threshold, items = items.len(), "trending threshold");
    ctx.counters().gauge(TRENDING_STATS, "ThresholdUsed", threshold as i64);

    for (content, n) in items {
        if n as f64 >= threshold {
            ctx.emit(content, n.to_string());
        }
    }
    Ok(())
}
