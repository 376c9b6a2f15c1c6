//! Per-user action tallies, ordered by post count.
//!
//! The map pre-aggregates in memory and emits one record per user, keyed
//! `user,<descending post count>` so users with more posts sort first within
//! any key range. The reduce formats one line per user.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use fnv::FnvHashMap;

use crate::codec;
use crate::error::RecordFormatError;
use crate::ordering::{composite_key, descending_component, primary_key};
use crate::transform::{GroupedReduce, Lines, StreamTransform, TaskContext};
use crate::Workload;

pub const ACTION_STATS: &str = "ActionStats";

/// Tallies for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCounts {
    pub posts: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
}

impl ActionCounts {
    /// Count one action. Returns `false` for an unknown action type.
    pub fn record(&mut self, action: &str) -> bool {
        let slot = match action.to_lowercase().as_str() {
            "post" => &mut self.posts,
            "like" => &mut self.likes,
            "comment" => &mut self.comments,
            "share" => &mut self.shares,
            _ => return false,
        };
        *slot += 1;
        true
    }

    pub fn add(&mut self, other: &ActionCounts) {
        self.posts += other.posts;
        self.likes += other.likes;
        self.comments += other.comments;
        self.shares += other.shares;
    }

    /// `p,l,c,s`
    pub fn encode(&self) -> String {
        format!("{},{},{},{}", self.posts, self.likes, self.comments, self.shares)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split(',').collect();
        let [posts, likes, comments, shares] = parts[..] else {
            bail!("expected 4 counts, found {}", parts.len());
        };
        let parse = |v: &str| v.parse::<u64>().with_context(|| format!("bad count `{v}`"));
        Ok(Self {
            posts: parse(posts)?,
            likes: parse(likes)?,
            comments: parse(comments)?,
            shares: parse(shares)?,
        })
    }
}

pub fn workload() -> Workload {
    Workload::new(
        Arc::new(StreamTransform::new("aggregation-map", map)),
        Arc::new(GroupedReduce::new("aggregation-reduce", ACTION_STATS, reduce).with_group_key(primary_key)),
    )
}

/// Input: cleansed lines, `user<TAB>timestamp<TAB>action<TAB>...`.
pub fn map(input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
    let mut tallies: FnvHashMap<String, ActionCounts> = FnvHashMap::default();
    for line in input {
        let text = String::from_utf8_lossy(&line);
        let fields = codec::fields(text.trim());
        let [user, _, action, ..] = fields[..] else {
            let cause = RecordFormatError::TooFewFields {
                expected: 3,
                found: fields.len(),
            };
            ctx.reject(ACTION_STATS, "missing_fields", &line, cause);
            continue;
        };
        if !tallies.entry(user.to_string()).or_default().record(action) {
            ctx.counters().incr(ACTION_STATS, "unknown_action", 1);
        }
    }

    for (user, counts) in tallies {
        let key = composite_key(&user, &descending_component(counts.posts)?);
        ctx.emit(key, counts.encode());
    }
    Ok(())
}

/// Emits `user<TAB>posts:P,likes:L,comments:C,shares:S` once per user.
pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    ctx: &mut TaskContext<'_>,
) -> Result<()> {
    let mut total = ActionCounts::default();
    for value in values {
        match ActionCounts::decode(&String::from_utf8_lossy(&value)) {
            Ok(counts) => total.add(&counts),
            Err(err) => ctx.reject(ACTION_STATS, "malformed_counts", &value, format!("{err:#}")),
        }
    }
    let value = format!(
        "posts:{},likes:{},comments:{},shares:{}",
        total.posts, total.likes, total.comments, total.shares
    );
    ctx.emit(key, value);
    Ok(())
}
