//! The interface between the executor and map/combine/reduce logic.
//!
//! A transform reads a finite stream of lines and emits records through a
//! [`TaskContext`]. Diagnostics go to a separate channel and never mix with
//! the emitted records. Returning an error fails the owning job.

use std::fmt::Display;
use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use itertools::Itertools;
use tracing::{debug, warn};

use crate::codec;
use crate::counters::{Counters, FRAMEWORK, TOTAL_DISCARDED};
use crate::standalone::JobEnv;
use crate::KeyValue;

/// The line stream handed to a transform.
pub type Lines<'a> = Box<dyn Iterator<Item = Bytes> + 'a>;

/// A transform over the whole line stream.
pub type StreamFn = fn(input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()>;

/// A reduce function takes in a key and an iterator over the values for that
/// key, and emits zero or more records through the context.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    ctx: &mut TaskContext<'_>,
) -> Result<()>;

/// Projects a record key onto the key records are grouped by.
pub type KeyFn = fn(key: &Bytes) -> Bytes;

/// Stderr prefix an external transform uses to fail its stage.
pub const FATAL_PREFIX: &str = "reporter:fatal:";

pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()>;
}

/// Everything a transform may interact with while it runs.
pub struct TaskContext<'a> {
    env: &'a JobEnv,
    counters: &'a Counters,
    output: Vec<KeyValue>,
    diagnostics: Vec<String>,
}

impl<'a> TaskContext<'a> {
    pub fn new(env: &'a JobEnv, counters: &'a Counters) -> Self {
        Self {
            env,
            counters,
            output: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn env(&self) -> &JobEnv {
        self.env
    }

    pub fn counters(&self) -> &Counters {
        self.counters
    }

    pub fn emit(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.output.push(KeyValue::new(key.into(), value.into()));
    }

    pub fn emit_record(&mut self, record: KeyValue) {
        self.output.push(record);
    }

    /// Write a line to the diagnostic channel.
    pub fn diagnostic(&mut self, message: impl Into<String>) {
        self.diagnostics.push(message.into());
    }

    /// Skip a record: log it with its cause and count it under
    /// `category,reason` and `category,total_discarded`.
    pub fn reject(&mut self, category: &str, reason: &str, line: &[u8], cause: impl Display) {
        let line = String::from_utf8_lossy(line);
        warn!(category, reason, line = %line, cause = %cause, "discarding record");
        self.counters.incr(category, reason, 1);
        self.counters.incr(category, TOTAL_DISCARDED, 1);
        self.diagnostics.push(format!("{reason}: {line}: {cause}"));
    }

    pub fn emitted(&self) -> usize {
        self.output.len()
    }

    pub fn into_parts(self) -> (Vec<KeyValue>, Vec<String>) {
        (self.output, self.diagnostics)
    }
}

/// Wraps a [`StreamFn`].
#[derive(Clone, Copy)]
pub struct StreamTransform {
    name: &'static str,
    f: StreamFn,
}

impl StreamTransform {
    pub fn new(name: &'static str, f: StreamFn) -> Self {
        Self { name, f }
    }
}

impl Transform for StreamTransform {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
        (self.f)(input, ctx)
    }
}

/// Decodes a sorted stream, groups consecutive records by a key projection,
/// and calls a [`ReduceFn`] once per group.
#[derive(Clone, Copy)]
pub struct GroupedReduce {
    name: &'static str,
    category: &'static str,
    group_key: KeyFn,
    reduce: ReduceFn,
}

impl GroupedReduce {
    /// Group by the full key.
    pub fn new(name: &'static str, category: &'static str, reduce: ReduceFn) -> Self {
        Self {
            name,
            category,
            group_key: Bytes::clone,
            reduce,
        }
    }

    pub fn with_group_key(mut self, group_key: KeyFn) -> Self {
        self.group_key = group_key;
        self
    }
}

impl Transform for GroupedReduce {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
        let mut records = Vec::new();
        for line in input {
            match codec::decode(&line) {
                Ok(kv) => records.push(kv),
                Err(err) => ctx.reject(self.category, "malformed_record", &line, err),
            }
        }
        for (key, group) in &records.into_iter().chunk_by(|kv| (self.group_key)(&kv.key)) {
            (self.reduce)(key, Box::new(group.map(KeyValue::into_value)), ctx)?;
        }
        Ok(())
    }
}

/// Emits every well-formed input record unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Transform for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn run(&self, input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
        for line in input {
            match codec::decode(&line) {
                Ok(kv) => ctx.emit_record(kv),
                Err(err) => ctx.reject(FRAMEWORK, "malformed_record", &line, err),
            }
        }
        Ok(())
    }
}

/// A user-supplied transform run as a child process.
///
/// Input lines are written to the child's stdin; stdout lines are decoded
/// as records; stderr is the diagnostic channel. Counter lines on stderr
/// are folded into the stage counters. A non-zero exit or a
/// `reporter:fatal:` line fails the stage.
#[derive(Clone, Debug)]
pub struct CommandTransform {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandTransform {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    /// Build from a whitespace-separated command line.
    pub fn parse(name: impl Into<String>, command_line: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace().map(String::from);
        let program = words
            .next()
            .ok_or_else(|| anyhow!("empty command line"))?;
        Ok(Self::new(name, program, words.collect()))
    }
}

impl Transform for CommandTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: Lines<'_>, ctx: &mut TaskContext<'_>) -> Result<()> {
        debug!(program = %self.program, args = ?self.args, "spawning transform");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(ctx.env().iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin of `{}` was not captured", self.program))?;
        let input: Vec<Bytes> = input.collect();
        // stdin is fed from its own thread so a child that fills its stdout
        // pipe before draining stdin cannot deadlock us.
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            for line in input {
                stdin.write_all(&line)?;
                stdin.write_all(b"\n")?;
            }
            Ok(())
        });

        let output = child.wait_with_output()?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.kind() == ErrorKind::BrokenPipe => {
                debug!(program = %self.program, "transform closed stdin early");
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => bail!("stdin writer for `{}` panicked", self.program),
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let mut fatal = None;
        for line in stderr.lines() {
            if ctx.counters().absorb_reporter_line(line) {
                continue;
            }
            if let Some(message) = line.strip_prefix(FATAL_PREFIX) {
                fatal = Some(message.trim().to_string());
            }
            ctx.diagnostic(line);
        }

        if !output.status.success() {
            bail!("`{}` exited with {}", self.program, output.status);
        }
        if let Some(message) = fatal {
            bail!("`{}` reported a fatal condition: {message}", self.program);
        }

        let stdout = Bytes::from(output.stdout);
        for line in codec::lines(&stdout) {
            match codec::decode(&line) {
                Ok(kv) => ctx.emit_record(kv),
                Err(err) => ctx.reject(FRAMEWORK, "malformed_output", &line, err),
            }
        }
        Ok(())
    }
}
