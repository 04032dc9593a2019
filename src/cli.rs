//! Command-line interface definitions using clap.

use crate::dispatch::{
    DEFAULT_CHUNK_CAPACITY, DispatchConfig, InspectCommand, RecordFormat, WorkerProgram,
};
use crate::error::{DispatchError, Result};
use crate::source::{DEFAULT_FETCH_TIMEOUT, FileSource, HttpSource, Source, StaticSource};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Fan room inspections out to parallel worker processes.
#[derive(Parser, Debug)]
#[command(name = "roomcrawl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all diagnostics except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect every item for one shared parameter using parallel workers.
    Run(RunArgs),

    /// Show how items would be split across workers without launching any.
    Plan(PlanArgs),

    /// Built-in worker process (started by `run`).
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "roomcrawl",
            &mut std::io::stdout(),
        );
    }
}

/// Where item identifiers come from. Exactly one must be given.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SourceArgs {
    /// File with a JSON array of ids or one id per line.
    #[arg(long, value_name = "PATH")]
    pub ids_file: Option<PathBuf>,

    /// URL returning a JSON array of ids.
    #[arg(long, value_name = "URL")]
    pub ids_url: Option<String>,

    /// Item id (repeatable).
    #[arg(long = "id", value_name = "ID")]
    pub ids: Vec<String>,
}

impl SourceArgs {
    pub fn source(&self, fetch_timeout: Duration) -> Source {
        if let Some(path) = &self.ids_file {
            Source::File(FileSource::new(path))
        } else if let Some(url) = &self.ids_url {
            Source::Http(HttpSource::new(url).with_timeout(fetch_timeout))
        } else {
            Source::Static(StaticSource::new(self.ids.iter().cloned()))
        }
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Value passed unchanged to every worker (e.g. a date).
    pub shared_parameter: String,

    #[command(flatten)]
    pub source: SourceArgs,

    /// Seconds to wait for --ids-url to answer.
    #[arg(
        long,
        value_name = "SECS",
        env = "ROOMCRAWL_FETCH_TIMEOUT",
        default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub fetch_timeout_secs: u64,

    /// Maximum items per worker.
    #[arg(short = 'c', long, env = "ROOMCRAWL_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_CAPACITY)]
    pub chunk_size: usize,

    /// External worker program (default: the built-in worker).
    #[arg(long, value_name = "PATH")]
    pub worker_program: Option<PathBuf>,

    /// Argument for the external worker program (repeatable).
    #[arg(long, value_name = "ARG", allow_hyphen_values = true, requires = "worker_program")]
    pub worker_arg: Vec<String>,

    /// Command the built-in worker runs per item as `<CMD> <ARGS...> <ID> <SHARED_PARAMETER>`.
    #[arg(long, value_name = "PROGRAM", env = "ROOMCRAWL_INSPECT_CMD")]
    pub inspect_cmd: Option<String>,

    /// Argument for the inspect command (repeatable).
    #[arg(long, value_name = "ARG", allow_hyphen_values = true)]
    pub inspect_arg: Vec<String>,

    /// Stop any worker still running after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub deadline_secs: Option<u64>,

    /// Milliseconds between SIGTERM and SIGKILL when stopping a worker.
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub kill_grace_ms: u64,

    /// Milliseconds to keep reading a worker's channel after it exited.
    #[arg(long, value_name = "MS", default_value_t = 2000)]
    pub drain_grace_ms: u64,

    /// Record format on stdout.
    #[arg(short, long, value_enum, default_value_t = RecordFormatArg::Plain)]
    pub format: RecordFormatArg,
}

impl RunArgs {
    pub fn identifier_source(&self) -> Source {
        self.source.source(Duration::from_secs(self.fetch_timeout_secs))
    }

    /// The worker program selected by the flags; an external program wins.
    pub fn worker_program(&self) -> Result<WorkerProgram> {
        if let Some(program) = &self.worker_program {
            return Ok(WorkerProgram::External {
                program: program.clone(),
                args: self.worker_arg.clone(),
            });
        }
        match &self.inspect_cmd {
            Some(cmd) if !cmd.trim().is_empty() => Ok(WorkerProgram::Internal {
                inspect: InspectCommand {
                    program: cmd.clone(),
                    args: self.inspect_arg.clone(),
                },
            }),
            _ => Err(DispatchError::Config(
                "either --worker-program or --inspect-cmd is required".into(),
            )),
        }
    }

    pub fn dispatch_config(&self) -> Result<DispatchConfig> {
        let mut config = DispatchConfig::new(self.shared_parameter.clone(), self.worker_program()?);
        config.chunk_capacity = self.chunk_size;
        config.deadline = self.deadline_secs.map(Duration::from_secs);
        config.kill_grace = Duration::from_millis(self.kill_grace_ms);
        config.drain_grace = Duration::from_millis(self.drain_grace_ms);
        config.validate()?;
        Ok(config)
    }
}

/// Arguments for the plan command.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Seconds to wait for --ids-url to answer.
    #[arg(
        long,
        value_name = "SECS",
        env = "ROOMCRAWL_FETCH_TIMEOUT",
        default_value_t = DEFAULT_FETCH_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub fetch_timeout_secs: u64,

    /// Maximum items per worker.
    #[arg(short = 'c', long, env = "ROOMCRAWL_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_CAPACITY)]
    pub chunk_size: usize,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = RecordFormatArg::Plain)]
    pub format: RecordFormatArg,
}

impl PlanArgs {
    pub fn identifier_source(&self) -> Source {
        self.source.source(Duration::from_secs(self.fetch_timeout_secs))
    }
}

/// Arguments for the hidden worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Program to run once per item.
    #[arg(long, value_name = "PROGRAM")]
    pub inspect_cmd: String,

    /// Argument for the inspect command (repeatable).
    #[arg(long, value_name = "ARG", allow_hyphen_values = true)]
    pub inspect_arg: Vec<String>,
}

impl WorkerArgs {
    pub fn inspect_command(&self) -> InspectCommand {
        InspectCommand {
            program: self.inspect_cmd.clone(),
            args: self.inspect_arg.clone(),
        }
    }
}

/// Record format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordFormatArg {
    /// One human-readable line per record.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

impl From<RecordFormatArg> for RecordFormat {
    fn from(arg: RecordFormatArg) -> Self {
        match arg {
            RecordFormatArg::Plain => RecordFormat::Plain,
            RecordFormatArg::Json => RecordFormat::Json,
        }
    }
}

/// Verbosity level for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and errors.
    Normal,
    /// -v: include launch and run progress.
    Info,
    /// -vv: include per-worker protocol detail.
    Debug,
}

impl Verbosity {
    pub fn level(self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::WARN,
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
        }
    }
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v and -q flags.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }

    /// Whether -v/-q was given explicitly and should win over environment settings.
    pub fn verbosity_explicit(&self) -> bool {
        self.quiet || self.verbose > 0
    }
}
