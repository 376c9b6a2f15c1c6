use std::fs;
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use mrsim::counters::DATA_QUALITY;
use mrsim::salt::KeySalter;
use mrsim::standalone::engine::run_job;
use mrsim::standalone::join::{run_join, JoinJob, JOIN_STATS};
use mrsim::standalone::{Job, JobEnv, JobState};
use mrsim::transform::{Lines, StreamTransform};
use mrsim::*;
use tempfile::TempDir;

#[test]
fn action_counts_for_one_user() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("cleansed.txt");
    fs::write(
        &input,
        "alice\t2024-01-01T00:00:00Z\tlike\tc1\t{}\nalice\t2024-01-01T00:00:01Z\tpost\tc2\t{}",
    )
    .unwrap();
    let output = dir.path().join("activity.txt");

    let job = Job::new(
        "aggregation",
        workload::named("aggregation").unwrap(),
        input.to_string_lossy(),
        &output,
    );
    let report = run_job(&job).unwrap();
    assert_eq!(report.output_records, 1);
    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "alice\tposts:1,likes:1,comments:0,shares:0\n"
    );
}

#[test]
fn malformed_line_is_counted_not_emitted() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("logs.txt");
    fs::write(&input, "badline\n").unwrap();
    let output = dir.path().join("cleansed.txt");

    let job = Job::new(
        "cleansing",
        workload::named("cleansing").unwrap(),
        input.to_string_lossy(),
        &output,
    );
    let report = run_job(&job).unwrap();
    assert_eq!(report.state, JobState::Done);
    assert_eq!(report.output_records, 0);
    assert_eq!(report.counters.get(DATA_QUALITY, "missing_fields"), 1);
    assert_eq!(report.counters.get(DATA_QUALITY, "total_discarded"), 1);
    assert_eq!(fs::read_to_string(&output).unwrap(), "");
}

#[test]
fn directory_input_is_one_stream() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in");
    fs::create_dir(&input).unwrap();
    fs::write(input.join("a.txt"), "bob\tt\tpost\tc1\t{}").unwrap();
    fs::write(input.join("b.txt"), "bob\tt\tpost\tc2\t{}\n").unwrap();
    let output = dir.path().join("out.txt");

    let job = Job::new(
        "aggregation",
        workload::named("aggregation").unwrap(),
        input.to_string_lossy(),
        &output,
    );
    run_job(&job).unwrap();
    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "bob\tposts:2,likes:0,comments:0,shares:0\n"
    );
}

fn failing_reduce(_input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
    ctx.diagnostic("giving up");
    bail!("reduce exploded")
}

#[test]
fn failed_job_commits_nothing_and_spills_its_input() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.txt");
    fs::write(&input, "k1\tv1\nk2\tv2\n").unwrap();
    let output = dir.path().join("out.txt");
    let spill = dir.path().join("spill");

    let workload = Workload::new(
        Arc::new(transform::Identity),
        Arc::new(StreamTransform::new("boom", failing_reduce)),
    );
    let job = Job::new("boom", workload, input.to_string_lossy(), &output)
        .with_spill_dir(Some(spill.clone()));
    let err = run_job(&job).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Reduce));
    assert_eq!(err.diagnostics(), ["giving up".to_string()]);
    assert!(!output.exists());

    let spilled = spill::read_parquet(&spill::spill_path(&spill, "boom", Stage::Reduce)).unwrap();
    assert_eq!(spilled.len(), 2);
    assert_eq!(spilled[0].key, Bytes::from("k1"));
}

fn join_job(dir: &TempDir, activity: &str, profiles: &str, env: JobEnv) -> JoinJob {
    let activity_path = dir.path().join("activity.txt");
    let profile_path = dir.path().join("profiles.txt");
    fs::write(&activity_path, activity).unwrap();
    fs::write(&profile_path, profiles).unwrap();
    JoinJob::new(
        "join",
        workload::activity_source(activity_path.to_string_lossy()),
        workload::profile_source(profile_path.to_string_lossy()),
        dir.path().join("joined.txt"),
    )
    .with_env(env)
}

#[tokio::test]
async fn join_emits_profile_then_activity() {
    let dir = TempDir::new().unwrap();
    let job = join_job(
        &dir,
        "u1\tposts:3,likes:5,comments:0,shares:1\n",
        "u1,Alice,NYC\nu2,Bob,LA\n",
        JobEnv::new(),
    );
    let report = run_join(job).await.unwrap();
    assert_eq!(report.input_records, 3);
    assert_eq!(report.output_records, 1);
    assert_eq!(
        fs::read_to_string(dir.path().join("joined.txt")).unwrap(),
        "u1\tAlice,NYC\tposts:3,likes:5,comments:0,shares:1\n"
    );
}

#[tokio::test]
async fn profile_only_user_produces_nothing() {
    let dir = TempDir::new().unwrap();
    let job = join_job(&dir, "", "u2,Bob,LA\n", JobEnv::new());
    let report = run_join(job).await.unwrap();
    assert_eq!(report.output_records, 0);
    assert_eq!(report.counters.get(JOIN_STATS, "unmatched_keys"), 1);
    assert_eq!(fs::read_to_string(dir.path().join("joined.txt")).unwrap(), "");
}

#[tokio::test]
async fn salted_hot_key_joins_once() {
    let dir = TempDir::new().unwrap();
    let env = JobEnv::new().with_skewed_keys([Bytes::from("u1")].iter());
    let job = join_job(
        &dir,
        "u1\tposts:9,likes:0,comments:0,shares:0\nu2\tposts:1,likes:0,comments:0,shares:0\n",
        "u1,Alice,NYC\nu2,Bob,LA\n",
        env,
    )
    .with_salter(KeySalter::new('#', 4).unwrap());
    let report = run_join(job).await.unwrap();

    // Both sides fan u1 out over 4 salts.
    assert_eq!(report.map_output_records, 10);
    assert_eq!(
        fs::read_to_string(dir.path().join("joined.txt")).unwrap(),
        "u1\tAlice,NYC\tposts:9,likes:0,comments:0,shares:0\n\
         u2\tBob,LA\tposts:1,likes:0,comments:0,shares:0\n"
    );
}
