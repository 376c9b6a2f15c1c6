//! The social media analytics workflow: cleansing, per-user aggregation,
//! trending content, and the user/profile join, chained over one output
//! directory.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::codec;
use crate::salt::{KeySalter, DEFAULT_NUM_SALTS, DEFAULT_SEPARATOR};
use crate::skew::{self, SkewReport, DEFAULT_THRESHOLD_FACTOR};
use crate::standalone::engine::run_job;
use crate::standalone::join::{run_join, JoinJob};
use crate::standalone::{Job, JobEnv, JobReport, TRENDING_THRESHOLD};
use crate::utils;
use crate::workload;

pub const LOGS_FILE: &str = "social_media_logs.txt";
pub const PROFILES_FILE: &str = "user_profiles.txt";
pub const CLEANSED_FILE: &str = "cleansed_data.txt";
pub const ACTIVITY_FILE: &str = "user_activity.txt";
pub const TRENDING_FILE: &str = "trending_content.txt";
pub const SKEW_FILE: &str = "skew_analysis.json";
pub const JOINED_FILE: &str = "joined_data.txt";
pub const SUMMARY_FILE: &str = "workflow_summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Cleansing,
    Aggregation,
    Trending,
    Join,
    All,
}

impl JobKind {
    fn includes(self, job: JobKind) -> bool {
        self == JobKind::All || self == job
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Cleansing => "cleansing",
            JobKind::Aggregation => "aggregation",
            JobKind::Trending => "trending",
            JobKind::Join => "join",
            JobKind::All => "all",
        };
        f.write_str(name)
    }
}

/// Workflow settings, read from an optional JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Passed to the trending job; negative means computed from the data.
    pub trending_threshold: i64,
    pub skew_threshold_factor: f64,
    pub num_salts: u32,
    pub salt_separator: char,
    pub spill_dir: Option<PathBuf>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
            trending_threshold: -1,
            skew_threshold_factor: DEFAULT_THRESHOLD_FACTOR,
            num_salts: DEFAULT_NUM_SALTS,
            salt_separator: DEFAULT_SEPARATOR,
            spill_dir: None,
        }
    }
}

impl WorkflowConfig {
    /// Load from `path`. A missing file gives the defaults; a file that
    /// does not parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("invalid configuration file {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "configuration file not found, using defaults");
                Ok(Self::default())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    pub fn salter(&self) -> Result<KeySalter> {
        KeySalter::new(self.salt_separator, self.num_salts)
    }

    fn input(&self, file: &str) -> String {
        self.input_dir.join(file).to_string_lossy().into_owned()
    }

    fn output(&self, file: &str) -> PathBuf {
        self.output_dir.join(file)
    }
}

/// What a workflow run produced.
#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub job: JobKind,
    pub reports: Vec<JobReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew: Option<SkewReport>,
    /// Record count of each output file, by file name.
    pub output_records: BTreeMap<String, usize>,
}

/// Profile the keys of a `key<TAB>value` file, directory or glob.
pub fn skew_report(input: &str, threshold_factor: f64) -> Result<skew::SkewProfile> {
    let data = utils::read_input(input)?;
    Ok(skew::profile(codec::lines(&data), threshold_factor))
}

/// Run `kind`. With [`JobKind::All`] each job reads the previous jobs'
/// outputs; a single job reads its input from the input directory. A failing
/// job stops the run, and outputs already committed stay in place.
pub async fn run(config: &WorkflowConfig, kind: JobKind) -> Result<WorkflowSummary> {
    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("failed to create {}", config.output_dir.display())
    })?;
    let chained = kind == JobKind::All;
    // Where a job finds the output of an upstream job.
    let upstream = |file: &str| {
        if chained {
            config.output(file).to_string_lossy().into_owned()
        } else {
            config.input(file)
        }
    };

    let mut summary = WorkflowSummary {
        job: kind,
        reports: Vec::new(),
        skew: None,
        output_records: BTreeMap::new(),
    };

    if kind.includes(JobKind::Cleansing) {
        let job = Job::new(
            "cleansing",
            workload::named("cleansing")?,
            config.input(LOGS_FILE),
            config.output(CLEANSED_FILE),
        );
        summary.reports.push(run_blocking(job, config).await?);
    }

    if kind.includes(JobKind::Aggregation) {
        let job = Job::new(
            "aggregation",
            workload::named("aggregation")?,
            upstream(CLEANSED_FILE),
            config.output(ACTIVITY_FILE),
        );
        summary.reports.push(run_blocking(job, config).await?);
    }

    if kind.includes(JobKind::Trending) {
        let job = Job::new(
            "trending",
            workload::named("trending")?,
            upstream(CLEANSED_FILE),
            config.output(TRENDING_FILE),
        )
        .with_env(JobEnv::new().with(TRENDING_THRESHOLD, config.trending_threshold.to_string()));
        summary.reports.push(run_blocking(job, config).await?);
    }

    if kind.includes(JobKind::Join) {
        let activity = upstream(ACTIVITY_FILE);
        let mut env = JobEnv::new();
        if chained {
            let profile = skew_report(&activity, config.skew_threshold_factor)?;
            let report = profile.report();
            write_json(&config.output(SKEW_FILE), &report)?;
            info!(
                skewed = report.skewed_keys_count,
                threshold = report.skew_threshold,
                "skew analysis complete"
            );
            env = env.with_skewed_keys(profile.skewed_keys());
            summary.skew = Some(report);
        }

        let job = JoinJob::new(
            "join",
            workload::activity_source(activity),
            workload::profile_source(config.input(PROFILES_FILE)),
            config.output(JOINED_FILE),
        )
        .with_env(env)
        .with_salter(config.salter()?)
        .with_spill_dir(config.spill_dir.clone());
        let report = run_join(job).await.map_err(|err| {
            error!(job = "join", error = %err, "workflow stopped");
            err
        })?;
        summary.reports.push(report);
    }

    for report in &summary.reports {
        if let Some(output) = &report.output {
            let name = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| output.display().to_string());
            summary.output_records.insert(name, utils::count_records(output)?);
        }
    }
    write_json(&config.output(SUMMARY_FILE), &summary)?;
    info!(job = %kind, output_dir = %config.output_dir.display(), "workflow complete");
    Ok(summary)
}

/// Run a single-source job on the blocking pool.
async fn run_blocking(job: Job, config: &WorkflowConfig) -> Result<JobReport> {
    let job = job.with_spill_dir(config.spill_dir.clone());
    let name = job.name.clone();
    let report = tokio::task::spawn_blocking(move || run_job(&job))
        .await
        .with_context(|| format!("job {name} was interrupted"))?;
    report.map_err(|err| {
        error!(job = %name, error = %err, "workflow stopped");
        err.into()
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}
