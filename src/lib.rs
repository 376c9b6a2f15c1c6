//! A single-machine MapReduce simulator.
//!
//! Jobs run map, an optional combine, a stable shuffle-sort, and reduce over
//! line-oriented `key<TAB>value` streams. A reducer sees every value of a key
//! contiguously, in a deterministic order, exactly once. A two-source tagged
//! merge-join is built on the same shuffle, with key salting for hot keys.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

pub mod codec;
pub mod counters;
pub mod error;
pub mod ordering;
pub mod salt;
pub mod skew;
pub mod spill;
pub mod standalone;
pub mod transform;
pub mod utils;
pub mod workflow;
pub mod workload;

pub use counters::Counters;
pub use error::{JobError, RecordFormatError, Stage};
pub use transform::{TaskContext, Transform};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// A map reduce application: a map transform, an optional combine
/// transform, and a reduce transform.
#[derive(Clone)]
pub struct Workload {
    pub map: Arc<dyn Transform>,
    pub combine: Option<Arc<dyn Transform>>,
    pub reduce: Arc<dyn Transform>,
}

impl Workload {
    pub fn new(map: Arc<dyn Transform>, reduce: Arc<dyn Transform>) -> Self {
        Self {
            map,
            combine: None,
            reduce,
        }
    }

    pub fn with_combine(mut self, combine: Arc<dyn Transform>) -> Self {
        self.combine = Some(combine);
        self
    }
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload")
            .field("map", &self.map.name())
            .field("combine", &self.combine.as_ref().map(|c| c.name()))
            .field("reduce", &self.reduce.name())
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> Bytes {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}
