//! Two-source tagged merge-join.
//!
//! Each source is mapped independently, and every record it emits is tagged
//! with its side and salted if its key is hot. Both tagged streams then go
//! through one stable shuffle-sort, so all records of a key are contiguous
//! regardless of source, and a single sequential scan joins them.
//!
//! Output lines are `key<TAB>right<TAB>left`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{info, warn};

use crate::counters::TOTAL_DISCARDED;
use crate::error::{JobError, RecordFormatError, Stage};
use crate::salt::KeySalter;
use crate::standalone::engine::{
    finish_report, perform_grouped, perform_map, perform_sort, Execution, JobTracker,
};
use crate::standalone::{JobEnv, JobReport, JobState};
use crate::transform::{Lines, TaskContext, Transform};
use crate::*;

pub const JOIN_STATS: &str = "JoinStats";
const TAG_SEPARATOR: u8 = b':';

/// Which input a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Tagged `A` on the wire.
    Left,
    /// Tagged `P` on the wire.
    Right,
}

impl JoinSide {
    pub fn tag(self) -> u8 {
        match self {
            JoinSide::Left => b'A',
            JoinSide::Right => b'P',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'A' => Some(JoinSide::Left),
            b'P' => Some(JoinSide::Right),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            JoinSide::Left => "left",
            JoinSide::Right => "right",
        }
    }
}

/// A value together with the side it came from. Encoded as `<tag>:<value>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedValue {
    pub side: JoinSide,
    pub value: Bytes,
}

impl TaggedValue {
    pub fn new(side: JoinSide, value: Bytes) -> Self {
        Self { side, value }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.value.len() + 2);
        buf.put_u8(self.side.tag());
        buf.put_u8(TAG_SEPARATOR);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    pub fn decode(raw: &Bytes) -> Result<Self, RecordFormatError> {
        match raw.as_ref() {
            [tag, TAG_SEPARATOR, ..] => {
                let side = JoinSide::from_tag(*tag)
                    .ok_or(RecordFormatError::UnknownTag(*tag as char))?;
                Ok(Self::new(side, raw.slice(2..)))
            }
            _ => Err(RecordFormatError::MissingTag),
        }
    }
}

/// One side of a join: the transform that maps it and where its input is.
#[derive(Clone)]
pub struct JoinSource {
    pub mapper: Arc<dyn Transform>,
    /// Input file, directory or glob pattern.
    pub input: String,
}

impl JoinSource {
    pub fn new(mapper: Arc<dyn Transform>, input: impl Into<String>) -> Self {
        Self {
            mapper,
            input: input.into(),
        }
    }
}

/// A join job descriptor.
#[derive(Clone)]
pub struct JoinJob {
    pub name: String,
    pub left: JoinSource,
    pub right: JoinSource,
    pub output: PathBuf,
    /// Carries `skewed.keys` for salting.
    pub env: JobEnv,
    pub salter: KeySalter,
    pub spill_dir: Option<PathBuf>,
}

impl JoinJob {
    pub fn new(
        name: impl Into<String>,
        left: JoinSource,
        right: JoinSource,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            left,
            right,
            output: output.into(),
            env: JobEnv::default(),
            salter: KeySalter::default(),
            spill_dir: None,
        }
    }

    pub fn with_env(mut self, env: JobEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_salter(mut self, salter: KeySalter) -> Self {
        self.salter = salter;
        self
    }

    pub fn with_spill_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.spill_dir = dir;
        self
    }

    fn source(&self, side: JoinSide) -> &JoinSource {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }
}

/// Tag every record with its side and salt the ones with hot keys. Records
/// whose key cannot be salted losslessly are dropped and counted.
pub fn tag_and_salt(
    side: JoinSide,
    records: Vec<KeyValue>,
    salter: &KeySalter,
    skewed_keys: &std::collections::HashSet<Bytes>,
    counters: &Counters,
) -> Vec<KeyValue> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let tagged = KeyValue::new(
            record.key(),
            TaggedValue::new(side, record.into_value()).encode(),
        );
        let key = tagged.key();
        match salter.salt(tagged, skewed_keys) {
            Ok(salted) => {
                if salted.len() > 1 {
                    counters.incr(JOIN_STATS, &format!("salted_{}_records", side.name()), 1);
                }
                out.extend(salted);
            }
            Err(err) => {
                warn!(side = side.name(), key = %String::from_utf8_lossy(&key), cause = %err, "discarding record");
                counters.incr(JOIN_STATS, "unsaltable_key", 1);
                counters.incr(JOIN_STATS, TOTAL_DISCARDED, 1);
            }
        }
    }
    out
}

/// Map one source and tag/salt what it emits. Returns the number of input
/// lines and the tagged records.
pub fn map_side(
    job: &JoinJob,
    side: JoinSide,
    input: &Bytes,
    counters: &Counters,
) -> Result<(usize, Vec<KeyValue>), JobError> {
    let source = job.source(side);
    let lines: Vec<Bytes> = codec::lines(input).collect();
    let mapped = perform_map(&job.name, source.mapper.as_ref(), &lines, &job.env, counters)?;
    let skewed = job.env.skewed_keys();
    let tagged = tag_and_salt(side, mapped.records, &job.salter, &skewed, counters);
    info!(job = %job.name, side = side.name(), records = tagged.len(), "mapped join source");
    Ok((lines.len(), tagged))
}

/// Shuffle-sort both tagged streams together and run the join scan.
pub fn execute_join(
    job: &JoinJob,
    left: Vec<KeyValue>,
    right: Vec<KeyValue>,
    input_records: usize,
    counters: &Counters,
) -> Result<Execution, JobError> {
    let mut tracker = JobTracker::new(&job.name);
    let mut records = left;
    records.extend(right);
    let map_output_records = records.len();
    if records.is_empty() {
        warn!(job = %job.name, "join sources produced no output");
        tracker.advance(JobState::Done);
        return Ok(Execution {
            records: Vec::new(),
            input_records,
            map_output_records,
            state: tracker.state(),
        });
    }

    tracker.advance(JobState::Sorting);
    perform_sort(&mut records);

    tracker.advance(JobState::Reducing);
    let reducer = JoinReducer::new(job.salter);
    let joined = perform_grouped(
        &job.name,
        Stage::Reduce,
        &reducer,
        &records,
        &job.env,
        counters,
        job.spill_dir.as_deref(),
    )
    .map_err(|e| tracker.fail(e))?;

    tracker.advance(JobState::Done);
    Ok(Execution {
        records: joined.records,
        input_records,
        map_output_records,
        state: tracker.state(),
    })
}

/// Run a join end to end. The two sources are read and mapped concurrently;
/// the output is committed only if every stage succeeds.
pub async fn run_join(job: JoinJob) -> Result<JobReport, JobError> {
    let started = Instant::now();
    info!(job = %job.name, left = %job.left.input, right = %job.right.input, "starting join");
    let job = Arc::new(job);
    let counters = Arc::new(Counters::new());

    let (left, right) = tokio::try_join!(
        map_side_blocking(job.clone(), JoinSide::Left, counters.clone()),
        map_side_blocking(job.clone(), JoinSide::Right, counters.clone()),
    )?;
    let (left_lines, left) = left;
    let (right_lines, right) = right;

    let execution = execute_join(&job, left, right, left_lines + right_lines, &counters)?;
    utils::commit_output(&job.output, &execution.records)?;

    let counters = Arc::try_unwrap(counters).unwrap_or_else(|shared| (*shared).clone());
    Ok(finish_report(&job.name, started, execution, counters, &job.output))
}

async fn map_side_blocking(
    job: Arc<JoinJob>,
    side: JoinSide,
    counters: Arc<Counters>,
) -> Result<(usize, Vec<KeyValue>), JobError> {
    let name = job.name.clone();
    tokio::task::spawn_blocking(move || {
        let input = utils::read_input(&job.source(side).input)?;
        map_side(&job, side, &input, &counters)
    })
    .await
    .map_err(|e| JobError::Interrupted {
        job: name,
        reason: e.to_string(),
    })?
}

/// The grouped sequential scan. Keeps one value per side for the current
/// logical key; a later value for the same side replaces an earlier one.
#[derive(Debug, Clone, Copy)]
pub struct JoinReducer {
    salter: KeySalter,
}

impl JoinReducer {
    pub fn new(salter: KeySalter) -> Self {
        Self { salter }
    }

    fn flush(
        ctx: &mut TaskContext<'_>,
        key: Option<Bytes>,
        left: Option<Bytes>,
        right: Option<Bytes>,
    ) {
        match (key, left, right) {
            (Some(key), Some(left), Some(right)) => {
                let mut value = BytesMut::with_capacity(left.len() + right.len() + 1);
                value.put_slice(&right);
                value.put_u8(codec::FIELD_SEPARATOR);
                value.put_slice(&left);
                ctx.counters().incr(JOIN_STATS, "joined_keys", 1);
                ctx.emit(key, value.freeze());
            }
            (Some(_), _, _) => ctx.counters().incr(JOIN_STATS, "unmatched_keys", 1),
            (None, _, _) => {}
        }
    }
}

impl Transform for JoinReducer {
    fn name(&self) -> &str {
        "merge-join"
    }

    fn run(&self, input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
        let mut current: Option<Bytes> = None;
        // Raw key of the first record in the current group. Salted copies
        // sort by salt index, so every source value shows up once here.
        let mut first_raw: Option<Bytes> = None;
        let mut left: Option<Bytes> = None;
        let mut right: Option<Bytes> = None;

        for line in input {
            let kv = match codec::decode(&line) {
                Ok(kv) => kv,
                Err(err) => {
                    ctx.reject(JOIN_STATS, "malformed_record", &line, err);
                    continue;
                }
            };
            let tagged = match TaggedValue::decode(&kv.value) {
                Ok(tagged) => tagged,
                Err(err) => {
                    ctx.reject(JOIN_STATS, "malformed_tag", &line, err);
                    continue;
                }
            };

            let key = self.salter.strip(&kv.key);
            if current.as_ref() != Some(&key) {
                Self::flush(ctx, current.take(), left.take(), right.take());
                current = Some(key);
                first_raw = Some(kv.key.clone());
            }

            let slot = match tagged.side {
                JoinSide::Left => &mut left,
                JoinSide::Right => &mut right,
            };
            // Later salt indexes replay the same values; count only the first.
            if slot.is_some() && first_raw.as_ref() == Some(&kv.key) {
                ctx.counters().incr(
                    JOIN_STATS,
                    &format!("replaced_{}_values", tagged.side.name()),
                    1,
                );
            }
            *slot = Some(tagged.value);
        }
        Self::flush(ctx, current, left, right);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Identity;
    use std::collections::HashSet;

    fn kv(k: &str, v: &str) -> KeyValue {
        KeyValue::new(Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes()))
    }

    fn job() -> JoinJob {
        JoinJob::new(
            "join",
            JoinSource::new(Arc::new(Identity), "unused"),
            JoinSource::new(Arc::new(Identity), "unused"),
            "unused",
        )
    }

    fn joined(left: Vec<KeyValue>, right: Vec<KeyValue>, skewed: &[&str]) -> (Bytes, Counters) {
        let job = job();
        let counters = Counters::new();
        let skewed: HashSet<Bytes> = skewed.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())).collect();
        let left = tag_and_salt(JoinSide::Left, left, &job.salter, &skewed, &counters);
        let right = tag_and_salt(JoinSide::Right, right, &job.salter, &skewed, &counters);
        let out = execute_join(&job, left, right, 0, &counters).unwrap();
        (codec::encode_stream(&out.records), counters)
    }

    #[test]
    fn tagged_value_wire_format() {
        let v = TaggedValue::new(JoinSide::Right, Bytes::from("Alice,NYC"));
        assert_eq!(v.encode(), Bytes::from("P:Alice,NYC"));
        assert_eq!(TaggedValue::decode(&v.encode()).unwrap(), v);
        assert_eq!(
            TaggedValue::decode(&Bytes::from("X:1")).unwrap_err(),
            RecordFormatError::UnknownTag('X')
        );
        assert_eq!(
            TaggedValue::decode(&Bytes::from("A")).unwrap_err(),
            RecordFormatError::MissingTag
        );
    }

    #[test]
    fn inner_join_emits_right_before_left() {
        let (out, counters) = joined(
            vec![kv("u1", "posts:3,likes:5,comments:0,shares:1")],
            vec![kv("u1", "Alice,NYC"), kv("u2", "Bob,LA")],
            &[],
        );
        assert_eq!(
            out,
            Bytes::from("u1\tAlice,NYC\tposts:3,likes:5,comments:0,shares:1\n")
        );
        assert_eq!(counters.get(JOIN_STATS, "joined_keys"), 1);
        assert_eq!(counters.get(JOIN_STATS, "unmatched_keys"), 1);
    }

    #[test]
    fn salted_keys_collapse_to_one_row() {
        let (out, counters) = joined(
            vec![kv("hot", "posts:9"), kv("cold", "posts:1")],
            vec![kv("hot", "Hana,Oslo"), kv("cold", "Cal,Rome")],
            &["hot"],
        );
        assert_eq!(
            out,
            Bytes::from("cold\tCal,Rome\tposts:1\nhot\tHana,Oslo\tposts:9\n")
        );
        assert_eq!(counters.get(JOIN_STATS, "salted_left_records"), 1);
        assert_eq!(counters.get(JOIN_STATS, "replaced_left_values"), 0);
    }

    #[test]
    fn later_value_for_a_side_wins() {
        let (out, counters) = joined(
            vec![kv("u1", "first"), kv("u1", "second")],
            vec![kv("u1", "profile")],
            &[],
        );
        assert_eq!(out, Bytes::from("u1\tprofile\tsecond\n"));
        assert_eq!(counters.get(JOIN_STATS, "replaced_left_values"), 1);
    }

    #[test]
    fn salted_repeats_count_one_replacement() {
        let job = job().with_salter(KeySalter::new('#', 4).unwrap());
        let counters = Counters::new();
        let skewed: HashSet<Bytes> = [Bytes::from("u1")].into_iter().collect();
        let left = tag_and_salt(
            JoinSide::Left,
            vec![kv("u1", "first"), kv("u1", "second")],
            &job.salter,
            &skewed,
            &counters,
        );
        let right = tag_and_salt(JoinSide::Right, vec![kv("u1", "profile")], &job.salter, &skewed, &counters);
        assert_eq!(left.len(), 8);

        let out = execute_join(&job, left, right, 0, &counters).unwrap();
        assert_eq!(codec::encode_stream(&out.records), Bytes::from("u1\tprofile\tsecond\n"));
        assert_eq!(counters.get(JOIN_STATS, "replaced_left_values"), 1);
        assert_eq!(counters.get(JOIN_STATS, "replaced_right_values"), 0);
    }

    #[test]
    fn keys_with_the_salt_separator_are_dropped() {
        let (out, counters) = joined(vec![kv("a#1", "x")], vec![kv("a#1", "y")], &[]);
        assert!(out.is_empty());
        assert_eq!(counters.get(JOIN_STATS, "unsaltable_key"), 2);
    }
}
