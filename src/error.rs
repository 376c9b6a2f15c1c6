//! Error types for record decoding and job execution.
//!
//! Per-record problems ([`RecordFormatError`]) are recoverable: the record is
//! skipped and tallied. Job-level problems ([`JobError`]) abort the job and
//! nothing is committed.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A single line or field could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordFormatError {
    #[error("line has no field separator")]
    MissingSeparator,

    #[error("expected at least {expected} fields, found {found}")]
    TooFewFields { expected: usize, found: usize },

    #[error("unparsable {field}: {reason}")]
    Unparsable { field: &'static str, reason: String },

    #[error("value carries no source tag")]
    MissingTag,

    #[error("unknown source tag {0:?}")]
    UnknownTag(char),

    #[error("key contains the salt separator {0:?}")]
    SeparatorInKey(char),
}

/// The pipeline stage a job was in when something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Input,
    Map,
    Combine,
    Reduce,
    Commit,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Map => "map",
            Stage::Combine => "combine",
            Stage::Reduce => "reduce",
            Stage::Commit => "commit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job could not complete.
#[derive(Error, Debug)]
pub enum JobError {
    /// A transform returned an error or signalled a fatal condition.
    #[error("job `{job}` failed in {stage} stage: {source}")]
    StageFailure {
        job: String,
        stage: Stage,
        /// Diagnostic lines the stage produced before failing.
        diagnostics: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("input `{0}` matched no files")]
    NoInput(String),

    #[error("failed to commit output {path}: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("job `{job}` was interrupted: {reason}")]
    Interrupted { job: String, reason: String },
}

impl JobError {
    /// The stage that failed, if the failure came from a transform.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobError::StageFailure { stage, .. } => Some(*stage),
            JobError::Commit { .. } => Some(Stage::Commit),
            JobError::NoInput(_) | JobError::Pattern(_) => Some(Stage::Input),
            _ => None,
        }
    }

    /// Diagnostics preserved from the failing stage.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            JobError::StageFailure { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_keeps_diagnostics() {
        let err = JobError::StageFailure {
            job: "trending".into(),
            stage: Stage::Reduce,
            diagnostics: vec!["bad line".into()],
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.stage(), Some(Stage::Reduce));
        assert_eq!(err.diagnostics(), ["bad line".to_string()]);
        assert_eq!(
            err.to_string(),
            "job `trending` failed in reduce stage: boom"
        );
    }
}
