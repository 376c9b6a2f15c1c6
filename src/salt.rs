//! Fan-out of hot keys over synthetic sub-keys, and the reverse mapping.
//!
//! A salted key is `primary + separator + index` with `index` in
//! `[0, num_salts)`. Keys entering the salter may not contain the separator,
//! which keeps [`KeySalter::strip`] lossless and idempotent.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RecordFormatError;
use crate::ordering::primary_key;
use crate::KeyValue;

pub const DEFAULT_NUM_SALTS: u32 = 10;
pub const DEFAULT_SEPARATOR: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySalter {
    separator: u8,
    num_salts: u32,
}

impl Default for KeySalter {
    fn default() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR as u8,
            num_salts: DEFAULT_NUM_SALTS,
        }
    }
}

impl KeySalter {
    pub fn new(separator: char, num_salts: u32) -> Result<Self> {
        ensure!(num_salts > 0, "number of salts must be positive");
        ensure!(
            separator.is_ascii() && !matches!(separator, '\t' | '\n' | '\r' | ','),
            "salt separator {separator:?} must be ASCII and distinct from the wire and composite separators"
        );
        Ok(Self {
            separator: separator as u8,
            num_salts,
        })
    }

    pub fn separator(&self) -> char {
        self.separator as char
    }

    pub fn num_salts(&self) -> u32 {
        self.num_salts
    }

    /// `key + separator + index`.
    pub fn apply(&self, key: &[u8], index: u32) -> Bytes {
        let index = index.to_string();
        let mut buf = BytesMut::with_capacity(key.len() + 1 + index.len());
        buf.put_slice(key);
        buf.put_u8(self.separator);
        buf.put_slice(index.as_bytes());
        buf.freeze()
    }

    /// Emit side. A record whose primary key is skewed becomes `num_salts`
    /// records, one per salt index, all carrying the same value; any other
    /// record passes through unchanged.
    pub fn salt(
        &self,
        record: KeyValue,
        skewed_keys: &HashSet<Bytes>,
    ) -> Result<Vec<KeyValue>, RecordFormatError> {
        if record.key.contains(&self.separator) {
            return Err(RecordFormatError::SeparatorInKey(self.separator()));
        }
        let primary = primary_key(&record.key);
        if !skewed_keys.contains(&primary) {
            return Ok(vec![record]);
        }
        Ok((0..self.num_salts)
            .map(|i| KeyValue::new(self.apply(&primary, i), record.value()))
            .collect())
    }

    /// Consume side. Drops a trailing `separator + digits` suffix; any other
    /// key is returned unchanged.
    pub fn strip(&self, key: &Bytes) -> Bytes {
        let Some(pos) = key.iter().rposition(|&b| b == self.separator) else {
            return key.clone();
        };
        let suffix = &key[pos + 1..];
        if !suffix.is_empty() && suffix.iter().all(u8::is_ascii_digit) {
            key.slice(..pos)
        } else {
            key.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skewed(keys: &[&'static str]) -> HashSet<Bytes> {
        keys.iter().map(|k| Bytes::from_static(k.as_bytes())).collect()
    }

    #[test]
    fn hot_key_fans_out_to_every_salt() {
        let salter = KeySalter::new('#', 3).unwrap();
        let out = salter
            .salt(
                KeyValue::new(Bytes::from("u1"), Bytes::from("A:posts:3")),
                &skewed(&["u1"]),
            )
            .unwrap();
        let keys: Vec<Bytes> = out.iter().map(KeyValue::key).collect();
        assert_eq!(keys, vec!["u1#0", "u1#1", "u1#2"]);
        assert!(out.iter().all(|kv| kv.value == "A:posts:3"));
        assert!(out.iter().all(|kv| salter.strip(&kv.key) == "u1"));
    }

    #[test]
    fn cold_key_passes_through() {
        let salter = KeySalter::default();
        let record = KeyValue::new(Bytes::from("u2"), Bytes::from("v"));
        let out = salter.salt(record.clone(), &skewed(&["u1"])).unwrap();
        assert_eq!(out, vec![record]);
    }

    #[test]
    fn separator_inside_key_is_rejected() {
        let salter = KeySalter::default();
        let err = salter
            .salt(KeyValue::new(Bytes::from("a#b"), Bytes::new()), &HashSet::new())
            .unwrap_err();
        assert_eq!(err, RecordFormatError::SeparatorInKey('#'));
    }

    #[test]
    fn strip_only_removes_numeric_suffixes() {
        let salter = KeySalter::default();
        assert_eq!(salter.strip(&Bytes::from("user_12")), "user_12");
        assert_eq!(salter.strip(&Bytes::from("u1#")), "u1#");
        assert_eq!(salter.strip(&Bytes::from("u1#x")), "u1#x");
        let once = salter.strip(&Bytes::from("u1#7"));
        assert_eq!(once, "u1");
        assert_eq!(salter.strip(&once), once);
    }

    #[test]
    fn invalid_configurations_are_refused() {
        assert!(KeySalter::new('#', 0).is_err());
        assert!(KeySalter::new('\t', 4).is_err());
        assert!(KeySalter::new(',', 4).is_err());
    }
}
