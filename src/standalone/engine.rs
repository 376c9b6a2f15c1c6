use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::counters::{PEAK_MEMORY_MB, PERFORMANCE, RECORDS_PER_SEC};
use crate::error::{JobError, Stage};
use crate::standalone::{Job, JobEnv, JobReport, JobState};
use crate::transform::{Lines, TaskContext, Transform};
use crate::*;

/// Records and diagnostics one stage produced.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub records: Vec<KeyValue>,
    pub diagnostics: Vec<String>,
}

/// Result of running a workload over an in-memory input.
#[derive(Debug, Default)]
pub struct Execution {
    pub records: Vec<KeyValue>,
    pub input_records: usize,
    pub map_output_records: usize,
    pub state: JobState,
}

/// Follows one job through `Idle -> Mapping -> Sorting -> (Combining ->
/// ReSorting)? -> Reducing -> Done | Failed`.
pub(crate) struct JobTracker<'a> {
    job: &'a str,
    state: JobState,
}

impl<'a> JobTracker<'a> {
    pub(crate) fn new(job: &'a str) -> Self {
        Self {
            job,
            state: JobState::Idle,
        }
    }

    pub(crate) fn advance(&mut self, next: JobState) {
        debug!(job = self.job, from = %self.state, to = %next, "job state");
        self.state = next;
    }

    pub(crate) fn state(&self) -> JobState {
        self.state
    }

    /// Mark the job failed and pass the error through.
    pub(crate) fn fail(&mut self, err: JobError) -> JobError {
        self.advance(JobState::Failed);
        err
    }
}

/// Run one transform over a line stream with a fresh stage accumulator that
/// is merged into `counters` whether or not the stage succeeds.
pub fn run_stage(
    job: &str,
    stage: Stage,
    transform: &dyn Transform,
    input: Lines<'_>,
    env: &JobEnv,
    counters: &Counters,
) -> Result<StageOutput, JobError> {
    let stage_counters = Counters::new();
    let mut ctx = TaskContext::new(env, &stage_counters);
    let result = transform.run(input, &mut ctx);
    let (records, diagnostics) = ctx.into_parts();
    counters.merge(&stage_counters);

    match result {
        Ok(()) => {
            info!(
                job,
                %stage,
                transform = transform.name(),
                records = records.len(),
                "stage complete"
            );
            Ok(StageOutput {
                records,
                diagnostics,
            })
        }
        Err(source) => {
            error!(
                job,
                %stage,
                transform = transform.name(),
                error = %source,
                "stage failed"
            );
            for line in &diagnostics {
                error!(job, %stage, "{line}");
            }
            Err(JobError::StageFailure {
                job: job.to_string(),
                stage,
                diagnostics,
                source,
            })
        }
    }
}

/// Feed the full input stream to the map transform.
pub fn perform_map(
    job: &str,
    map: &dyn Transform,
    input: &[Bytes],
    env: &JobEnv,
    counters: &Counters,
) -> Result<StageOutput, JobError> {
    run_stage(
        job,
        Stage::Map,
        map,
        Box::new(input.iter().cloned()),
        env,
        counters,
    )
}

/// Establish the global key order. Stable, so equal keys keep their
/// relative order.
pub fn perform_sort(records: &mut [KeyValue]) {
    ordering::sort_stable(records);
}

/// Feed a sorted stream to a combine or reduce transform. If the stage fails
/// and `spill_dir` is set, the stream is written there for inspection.
pub fn perform_grouped(
    job: &str,
    stage: Stage,
    transform: &dyn Transform,
    records: &[KeyValue],
    env: &JobEnv,
    counters: &Counters,
    spill_dir: Option<&Path>,
) -> Result<StageOutput, JobError> {
    let lines = records.iter().map(|kv| codec::encode(&kv.key, &kv.value));
    let result = run_stage(job, stage, transform, Box::new(lines), env, counters);
    if result.is_err() {
        if let Some(dir) = spill_dir {
            let path = spill::spill_path(dir, job, stage);
            match spill::write_parquet(&path, records) {
                Ok(()) => warn!(job, %stage, path = %path.display(), "spilled stage input"),
                Err(err) => warn!(job, %stage, error = %err, "failed to spill stage input"),
            }
        }
    }
    result
}

/// Run map, sort, the optional combine and re-sort, and reduce over an
/// in-memory input. Nothing is written.
pub fn execute(
    job: &str,
    workload: &Workload,
    input: &Bytes,
    env: &JobEnv,
    counters: &Counters,
    spill_dir: Option<&Path>,
) -> Result<Execution, JobError> {
    let mut tracker = JobTracker::new(job);
    let lines: Vec<Bytes> = codec::lines(input).collect();

    tracker.advance(JobState::Mapping);
    let mapped = perform_map(job, workload.map.as_ref(), &lines, env, counters)
        .map_err(|e| tracker.fail(e))?;
    let map_output_records = mapped.records.len();
    sample_memory(counters);

    if mapped.records.is_empty() {
        warn!(job, "map produced no output");
        tracker.advance(JobState::Done);
        return Ok(Execution {
            records: Vec::new(),
            input_records: lines.len(),
            map_output_records,
            state: tracker.state(),
        });
    }

    tracker.advance(JobState::Sorting);
    let mut records = mapped.records;
    perform_sort(&mut records);

    if let Some(combine) = &workload.combine {
        tracker.advance(JobState::Combining);
        let combined = perform_grouped(
            job,
            Stage::Combine,
            combine.as_ref(),
            &records,
            env,
            counters,
            spill_dir,
        )
        .map_err(|e| tracker.fail(e))?;
        tracker.advance(JobState::ReSorting);
        records = combined.records;
        perform_sort(&mut records);
    }

    tracker.advance(JobState::Reducing);
    let reduced = perform_grouped(
        job,
        Stage::Reduce,
        workload.reduce.as_ref(),
        &records,
        env,
        counters,
        spill_dir,
    )
    .map_err(|e| tracker.fail(e))?;
    sample_memory(counters);

    tracker.advance(JobState::Done);
    Ok(Execution {
        records: reduced.records,
        input_records: lines.len(),
        map_output_records,
        state: tracker.state(),
    })
}

/// Run a job end to end: read its input, execute every stage, and commit
/// the output only if all of them succeed.
pub fn run_job(job: &Job) -> Result<JobReport, JobError> {
    let started = Instant::now();
    info!(job = %job.name, input = %job.input, workload = ?job.workload, "starting job");
    let input = utils::read_input(&job.input)?;

    let counters = Counters::new();
    let execution = execute(
        &job.name,
        &job.workload,
        &input,
        &job.env,
        &counters,
        job.spill_dir.as_deref(),
    )?;
    utils::commit_output(&job.output, &execution.records)?;

    Ok(finish_report(
        &job.name,
        started,
        execution,
        counters,
        &job.output,
    ))
}

/// Record performance counters, log every counter on the diagnostic
/// channel and build the report.
pub(crate) fn finish_report(
    job: &str,
    started: Instant,
    execution: Execution,
    counters: Counters,
    output: &Path,
) -> JobReport {
    let elapsed = started.elapsed();
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    let input_records = execution.input_records as i64;
    counters.incr(PERFORMANCE, "TotalRecords", input_records);
    counters.incr(PERFORMANCE, "ElapsedMillis", elapsed_ms as i64);
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        counters.gauge(PERFORMANCE, RECORDS_PER_SEC, (input_records as f64 / secs) as i64);
    }
    sample_memory(&counters);

    for line in counters.reporter_lines() {
        info!(job, "{line}");
    }
    info!(
        job,
        records = execution.records.len(),
        elapsed_ms,
        output = %output.display(),
        "job complete"
    );

    JobReport {
        job: job.to_string(),
        state: execution.state,
        input_records: execution.input_records,
        map_output_records: execution.map_output_records,
        output_records: execution.records.len(),
        elapsed_ms,
        counters,
        output: Some(output.to_path_buf()),
    }
}

fn sample_memory(counters: &Counters) {
    if let Some(mb) = utils::resident_memory_mb() {
        counters.gauge(PERFORMANCE, PEAK_MEMORY_MB, mb);
    }
}
