//! Validation of raw activity log lines.
//!
//! Input: `Timestamp<TAB>UserID<TAB>Action<TAB>ContentID<TAB>Metadata`.
//! Output: `UserID<TAB>Timestamp<TAB>Action<TAB>ContentID<TAB>Metadata`.

use anyhow::Result;
use bytes::Bytes;
use chrono::NaiveDateTime;
use regex::Regex;
use thiserror::Error;

use crate::counters::{DATA_QUALITY, TOTAL_DISCARDED};
use crate::transform::{Lines, TaskContext, Transform};

const TIMESTAMP_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z?$";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Why a log line was discarded. The counter name is the reason.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("expected at least 5 fields, found {0}")]
    MissingFields(usize),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("malformed metadata: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

impl Rejection {
    pub fn counter(&self) -> &'static str {
        match self {
            Rejection::MissingFields(_) => "missing_fields",
            Rejection::InvalidTimestamp(_) => "invalid_timestamp",
            Rejection::MalformedJson(_) => "malformed_json",
        }
    }
}

/// A validated log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord<'a> {
    pub timestamp: &'a str,
    pub user: &'a str,
    pub action: &'a str,
    pub content: &'a str,
    pub metadata: &'a str,
}

pub struct CleansingMapper {
    timestamp: Regex,
}

impl CleansingMapper {
    pub fn new() -> Result<Self> {
        Ok(Self {
            timestamp: Regex::new(TIMESTAMP_PATTERN)?,
        })
    }

    fn valid_timestamp(&self, raw: &str) -> bool {
        if !self.timestamp.is_match(raw) {
            return false;
        }
        let raw = raw.strip_suffix('Z').unwrap_or(raw);
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).is_ok()
    }

    /// Check one line. Fields beyond the fifth are ignored.
    pub fn validate<'a>(&self, line: &'a str) -> Result<LogRecord<'a>, Rejection> {
        let fields: Vec<&str> = line.trim().split('\t').collect();
        let [timestamp, user, action, content, metadata, ..] = fields[..] else {
            return Err(Rejection::MissingFields(fields.len()));
        };
        if !self.valid_timestamp(timestamp) {
            return Err(Rejection::InvalidTimestamp(timestamp.to_string()));
        }
        serde_json::from_str::<serde_json::Value>(metadata)?;
        Ok(LogRecord {
            timestamp,
            user,
            action,
            content,
            metadata,
        })
    }
}

impl Transform for CleansingMapper {
    fn name(&self) -> &str {
        "cleansing-map"
    }

    fn run(&self, input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
        // Report every rejection counter, even at zero.
        for name in ["missing_fields", "invalid_timestamp", "malformed_json", TOTAL_DISCARDED] {
            ctx.counters().incr(DATA_QUALITY, name, 0);
        }

        for line in input {
            let text = String::from_utf8_lossy(&line);
            match self.validate(&text) {
                Ok(record) => {
                    let value = [
                        record.timestamp,
                        record.action,
                        record.content,
                        record.metadata,
                    ]
                    .join("\t");
                    ctx.emit(Bytes::copy_from_slice(record.user.as_bytes()), value);
                }
                Err(rejection) => {
                    ctx.reject(DATA_QUALITY, rejection.counter(), &line, &rejection)
                }
            }
        }
        Ok(())
    }
}
