use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mrsim::standalone::engine::run_job;
use mrsim::standalone::{Args, Commands, Job, JobEnv};
use mrsim::transform::CommandTransform;
use mrsim::workflow::{self, WorkflowConfig};
use mrsim::*;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

/// A workload from either a registered name or external command lines.
fn submitted_workload(
    name: Option<String>,
    mapper: Option<String>,
    combiner: Option<String>,
    reducer: Option<String>,
) -> Result<Workload> {
    match (name, mapper, reducer) {
        (Some(name), _, _) => workload::named(&name),
        (None, Some(mapper), Some(reducer)) => {
            let mut workload = Workload::new(
                Arc::new(CommandTransform::parse("mapper", &mapper)?),
                Arc::new(CommandTransform::parse("reducer", &reducer)?),
            );
            if let Some(combiner) = combiner {
                workload = workload.with_combine(Arc::new(CommandTransform::parse("combiner", &combiner)?));
            }
            Ok(workload)
        }
        _ => bail!("either --workload or both --mapper and --reducer are required"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Commands::Run {
            job,
            config,
            input_dir,
            output_dir,
        } => {
            let mut config = WorkflowConfig::load(config.as_deref())?;
            if let Some(dir) = input_dir {
                config.input_dir = dir;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            let summary = workflow::run(&config, job).await?;
            print_json(&summary.output_records)
        }
        Commands::Submit {
            input,
            workload,
            mapper,
            combiner,
            reducer,
            output,
            spill_dir,
            env,
        } => {
            let workload = submitted_workload(workload, mapper, combiner, reducer)?;
            let job = Job::new("submit", workload, input, output)
                .with_env(JobEnv::from_assignments(&env)?)
                .with_spill_dir(spill_dir);
            let report = run_job(&job)?;
            print_json(&report)
        }
        Commands::Skew {
            input,
            factor,
            output,
        } => {
            let report = workflow::skew_report(&input, factor)?.report();
            match output {
                Some(path) => std::fs::write(&path, serde_json::to_vec_pretty(&report)?)
                    .with_context(|| format!("failed to write {}", path.display())),
                None => print_json(&report),
            }
        }
        Commands::Inspect { path } => {
            let records = spill::read_parquet(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            std::io::stdout()
                .lock()
                .write_all(&codec::encode_stream(&records))?;
            Ok(())
        }
    }
}
