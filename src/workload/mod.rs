//! Converts workload names to the transforms that implement them.
//!
//! # Example
//!
//! To get the trending content workload:
//! ```
//! # use anyhow::Result;
//! use mrsim::workload;
//! # fn main() -> Result<()> {
//! let trending = workload::named("trending")?;
//! assert!(trending.combine.is_some());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::standalone::join::JoinSource;
use crate::transform::{StreamTransform, Transform};
use crate::Workload;

pub mod aggregation;
pub mod cleansing;
pub mod join;
pub mod trending;

/// Names accepted by [`named`].
pub const NAMES: [&str; 3] = ["cleansing", "aggregation", "trending"];

/// Gets the [`Workload`] named `name`.
///
/// Returns `Ok(None)` if no workload with the given name exists.
pub fn try_named(name: &str) -> Result<Option<Workload>> {
    let workload = match name {
        "cleansing" => Workload::new(
            Arc::new(cleansing::CleansingMapper::new()?),
            Arc::new(crate::transform::Identity),
        ),
        "aggregation" => aggregation::workload(),
        "trending" => trending::workload(),
        _ => return Ok(None),
    };
    Ok(Some(workload))
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no workload with the given name exists.
pub fn named(name: &str) -> Result<Workload> {
    try_named(name)?.ok_or_else(|| {
        anyhow!(
            "No workload named `{}` found (expected one of: {}).",
            name,
            NAMES.join(", ")
        )
    })
}

/// The left (activity) side of the user join.
pub fn activity_source(input: impl Into<String>) -> JoinSource {
    JoinSource::new(transform("join-activity-map", join::activity_map), input)
}

/// The right (profile) side of the user join.
pub fn profile_source(input: impl Into<String>) -> JoinSource {
    JoinSource::new(transform("join-profile-map", join::profile_map), input)
}

fn transform(name: &'static str, f: crate::transform::StreamFn) -> Arc<dyn Transform> {
    Arc::new(StreamTransform::new(name, f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_name_resolves() {
        for name in NAMES {
            assert!(named(name).is_ok(), "{name}");
        }
        assert!(try_named("wc").unwrap().is_none());
        assert!(named("wc").is_err());
    }

    #[test]
    fn only_trending_has_a_combiner() {
        assert!(named("trending").unwrap().combine.is_some());
        assert!(named("aggregation").unwrap().combine.is_none());
        assert_eq!(named("cleansing").unwrap().reduce.name(), "identity");
    }
}
