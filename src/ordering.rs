//! Total order over keys, and helpers for building composite keys.
//!
//! Keys compare byte-wise lexicographically. A composite key is
//! `primary,secondary`; grouping by primary component relies on the
//! primary never containing the separator.

use std::cmp::Ordering;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::KeyValue;

/// Separates the primary component of a composite key from its sort suffix.
pub const COMPOSITE_SEPARATOR: u8 = b',';

/// Largest count a descending sort component can hold.
pub const DESCENDING_MAX: u64 = 9_999_999_999;
/// Digit width of a descending sort component.
pub const DESCENDING_WIDTH: usize = 10;

/// Byte-wise lexicographic comparison.
#[inline]
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Stable sort of a stream by key. Records with equal keys keep their
/// relative input order.
pub fn sort_stable(records: &mut [KeyValue]) {
    records.sort_by(|a, b| compare(&a.key, &b.key));
}

/// Whether a stream is already in key order.
pub fn is_sorted(records: &[KeyValue]) -> bool {
    records
        .windows(2)
        .all(|w| compare(&w[0].key, &w[1].key) != Ordering::Greater)
}

/// The primary component of a possibly composite key.
pub fn primary_key(key: &Bytes) -> Bytes {
    match key.iter().position(|&b| b == COMPOSITE_SEPARATOR) {
        Some(pos) => key.slice(..pos),
        None => key.clone(),
    }
}

/// Zero-padded `DESCENDING_MAX - value`, so that ascending byte order on the
/// result is descending order on `value`.
pub fn descending_component(value: u64) -> Result<String> {
    if value > DESCENDING_MAX {
        bail!("count {value} exceeds the descending sort range ({DESCENDING_MAX})");
    }
    Ok(format!(
        "{:0width$}",
        DESCENDING_MAX - value,
        width = DESCENDING_WIDTH
    ))
}

/// Build `primary,secondary`.
pub fn composite_key(primary: &str, secondary: &str) -> String {
    format!("{primary}{}{secondary}", COMPOSITE_SEPARATOR as char)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(k: &'static str, v: &'static str) -> KeyValue {
        KeyValue::new(Bytes::from_static(k.as_bytes()), Bytes::from_static(v.as_bytes()))
    }

    #[test]
    fn sort_is_stable() {
        let mut records = vec![kv("b", "1"), kv("a", "1"), kv("b", "2"), kv("a", "2")];
        sort_stable(&mut records);
        let got: Vec<_> = records.iter().map(|r| (r.key(), r.value())).collect();
        assert_eq!(
            got,
            vec![
                (Bytes::from("a"), Bytes::from("1")),
                (Bytes::from("a"), Bytes::from("2")),
                (Bytes::from("b"), Bytes::from("1")),
                (Bytes::from("b"), Bytes::from("2")),
            ]
        );
        assert!(is_sorted(&records));
    }

    #[test]
    fn descending_component_inverts_order() {
        let three = descending_component(3).unwrap();
        let twelve = descending_component(12).unwrap();
        assert_eq!(three.len(), DESCENDING_WIDTH);
        assert!(twelve < three);
        assert!(descending_component(DESCENDING_MAX + 1).is_err());
    }

    #[test]
    fn primary_key_takes_text_before_comma() {
        assert_eq!(primary_key(&Bytes::from("u1,0000000007")), Bytes::from("u1"));
        assert_eq!(primary_key(&Bytes::from("u1")), Bytes::from("u1"));
        assert_eq!(composite_key("u1", "07"), "u1,07");
    }
}
