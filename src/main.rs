//! roomcrawl - parallel room availability inspection

mod cli;
mod dispatch;
mod error;
mod logging;
mod source;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use std::io::Write;
use tracing::{info, warn};

use cli::{Cli, Commands, PlanArgs, RunArgs, Verbosity};
use dispatch::{ChunkPlan, LineSink, RecordFormat, Supervisor, partition};
use logging::LogConfig;
use source::IdentifierSource;

/// Program entry point: parses CLI arguments, dispatches the selected command, and handles top-level errors.
///
/// On error prints a colored error header followed by each cause in the error
/// chain and exits with status code 1. A completed run exits with the code its
/// summary dictates.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let level_from_cli = cli.verbosity_explicit();
    let log_config = LogConfig::new()
        .with_level(cli.verbosity().level())
        .with_span_events(cli.verbosity() >= Verbosity::Debug)
        .with_env_overrides(level_from_cli);
    logging::init(log_config, !cli.no_color);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Plan(args) => cmd_plan(args),
        Commands::Worker(args) => dispatch::run_worker_main(args.inspect_command()),
        Commands::Completions(args) => {
            args.generate();
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            // Print the error chain if there are causes
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")
}

/// Fetch identifiers, launch one worker per chunk, and stream records to stdout.
///
/// Returns the process exit code derived from the run summary.
fn cmd_run(args: &RunArgs) -> Result<i32> {
    let config = args.dispatch_config()?;
    let supervisor = Supervisor::new(config)?;
    let rt = runtime()?;

    rt.block_on(async {
        let items = args
            .identifier_source()
            .fetch()
            .await
            .context("Could not load item identifiers")?;

        let cancel = supervisor.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping workers");
                cancel.cancel();
            }
        });

        let sink = LineSink::new(std::io::stdout(), RecordFormat::from(args.format));
        let summary = supervisor.run(&items, sink).await?;
        Ok::<_, anyhow::Error>(summary.exit_code())
    })
}

/// Print the chunk assignment without launching anything.
fn cmd_plan(args: &PlanArgs) -> Result<i32> {
    let rt = runtime()?;
    let items = rt
        .block_on(args.identifier_source().fetch())
        .context("Could not load item identifiers")?;

    let chunks = partition(&items, args.chunk_size)?;
    let plan = ChunkPlan::of(&chunks, args.chunk_size);

    let mut out = std::io::stdout().lock();
    for (worker, chunk) in chunks.iter().enumerate() {
        match RecordFormat::from(args.format) {
            RecordFormat::Plain => {
                let ids: Vec<&str> = chunk.items().iter().map(|item| item.as_str()).collect();
                writeln!(out, "worker {}: {}", worker, ids.join(", "))?;
            }
            RecordFormat::Json => {
                let line = serde_json::json!({ "worker": worker, "items": chunk.items() });
                writeln!(out, "{}", line)?;
            }
        }
    }
    out.flush()?;

    info!(
        items = plan.total_items,
        workers = plan.chunk_count(),
        capacity = plan.capacity,
        remainder = plan.remainder(),
        "Plan ready"
    );
    Ok(0)
}
