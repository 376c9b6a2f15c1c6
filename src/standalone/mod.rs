use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::skew::DEFAULT_THRESHOLD_FACTOR;
use crate::workflow::JobKind;
use crate::{Counters, Workload};

pub mod engine;
pub mod join;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the analytics workflow, or a single job of it
    Run {
        /// Which job to run
        #[arg(short, long, value_enum, default_value_t = JobKind::All)]
        job: JobKind,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Input directory (overrides the configuration file)
        #[arg(long)]
        input_dir: Option<PathBuf>,

        /// Output directory (overrides the configuration file)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Run a single job from a named workload or external commands
    Submit {
        /// Input file, directory or glob pattern
        #[arg(short, long)]
        input: String,

        /// Name of a built-in workload
        #[arg(short, long, conflicts_with_all = ["mapper", "reducer"])]
        workload: Option<String>,

        /// Map command line
        #[arg(long, requires = "reducer")]
        mapper: Option<String>,

        /// Optional combine command line
        #[arg(long)]
        combiner: Option<String>,

        /// Reduce command line
        #[arg(long, requires = "mapper")]
        reducer: Option<String>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Directory for failed stage inputs
        #[arg(long)]
        spill_dir: Option<PathBuf>,

        /// KEY=VALUE entries visible to the transforms.
        #[clap(value_parser, last = true)]
        env: Vec<String>,
    },
    /// Print the key distribution report of a key/value file
    Skew {
        /// Input file, directory or glob pattern
        #[arg(short, long)]
        input: String,

        /// Fraction of all records above which a key is skewed
        #[arg(short, long, default_value_t = DEFAULT_THRESHOLD_FACTOR)]
        factor: f64,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a spilled stage input in wire format
    Inspect {
        /// Parquet spill file
        path: PathBuf,
    },
}

/// Environment key holding the comma-joined skewed key set.
pub const SKEWED_KEYS: &str = "skewed.keys";
/// Environment key holding the trending threshold; `-1` computes it.
pub const TRENDING_THRESHOLD: &str = "TRENDING_THRESHOLD";

/// Configuration visible to a job's transforms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnv(BTreeMap<String, String>);

impl JobEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Parse `KEY=VALUE` entries.
    pub fn from_assignments(items: &[String]) -> Result<Self> {
        let mut env = Self::new();
        for item in items {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got `{item}`"))?;
            env.set(key, value);
        }
        Ok(env)
    }

    pub fn with_skewed_keys<'a, I>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        let joined = keys
            .into_iter()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect::<Vec<_>>()
            .join(",");
        self.with(SKEWED_KEYS, joined)
    }

    /// The skewed key set, empty when unset.
    pub fn skewed_keys(&self) -> HashSet<Bytes> {
        self.get(SKEWED_KEYS)
            .map(|joined| {
                joined
                    .split(',')
                    .filter(|k| !k.is_empty())
                    .map(|k| Bytes::copy_from_slice(k.as_bytes()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A fixed trending threshold, or `None` when it should be computed from
    /// the data (unset or negative).
    pub fn trending_threshold(&self) -> Result<Option<f64>> {
        let Some(raw) = self.get(TRENDING_THRESHOLD) else {
            return Ok(None);
        };
        let value: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {TRENDING_THRESHOLD} `{raw}`"))?;
        Ok((value >= 0.0).then_some(value))
    }
}

/// A job descriptor.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub workload: Workload,
    /// Input file, directory or glob pattern.
    pub input: String,
    pub output: PathBuf,
    pub env: JobEnv,
    /// Where the input of a failing combine/reduce stage is spilled.
    pub spill_dir: Option<PathBuf>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        workload: Workload,
        input: impl Into<String>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            workload,
            input: input.into(),
            output: output.into(),
            env: JobEnv::default(),
            spill_dir: None,
        }
    }

    pub fn with_env(mut self, env: JobEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_spill_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.spill_dir = dir;
        self
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum JobState {
    #[default]
    Idle,
    Mapping,
    Sorting,
    Combining,
    ReSorting,
    Reducing,
    Done,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: String,
    pub state: JobState,
    pub input_records: usize,
    pub map_output_records: usize,
    pub output_records: usize,
    pub elapsed_ms: u64,
    pub counters: Counters,
    pub output: Option<PathBuf>,
}
