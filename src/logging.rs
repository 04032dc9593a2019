//! Diagnostic logging for the orchestrator and its workers.
//!
//! Diagnostics always go to stderr (and optionally a file). Run records are
//! written to stdout separately and never pass through tracing.
//!
//! # Environment Variables
//!
//! - `ROOMCRAWL_LOG` - Log filter (overrides RUST_LOG)
//! - `ROOMCRAWL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `ROOMCRAWL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `ROOMCRAWL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Worker processes inherit the environment, so the same settings apply to them.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    Pretty,
    /// Compact single-line format (default; keeps worker lines short)
    #[default]
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Path to log file (None = stderr only); never rotated
    pub file_path: Option<PathBuf>,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            span_events: false,
            filter: None,
            show_target: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Enable span timing events (the `dispatch` span reports total run time).
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// With `level_from_cli` set, `-v`/`-q` already chose the level and the
    /// filter and level variables are ignored. Format and file always apply.
    pub fn with_env_overrides(mut self, level_from_cli: bool) -> Self {
        if !level_from_cli && self.filter.is_none() {
            if let Ok(filter) = std::env::var("ROOMCRAWL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if !level_from_cli
            && self.filter.is_none()
            && let Ok(level_str) = std::env::var("ROOMCRAWL_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("ROOMCRAWL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("ROOMCRAWL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One formatting layer for `writer` in the configured format.
    fn layer<S, W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.pretty().boxed(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber.
///
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig, color: bool) {
    let file_layer = config.file_path.as_deref().map(|path| {
        let appender = file_appender(path);
        config.layer(appender, false)
    });

    let result = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(config.layer(std::io::stderr, color))
        .with(file_layer)
        .try_init();

    // Already initialized (tests, repeated calls)
    let _ = result;
}

/// Every process of a run appends to the same file.
fn file_appender(path: &Path) -> RollingFileAppender {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("roomcrawl.log");

    RollingFileAppender::new(Rotation::NEVER, parent, file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "ROOMCRAWL_LOG",
        "ROOMCRAWL_LOG_LEVEL",
        "ROOMCRAWL_LOG_FORMAT",
        "ROOMCRAWL_LOG_FILE",
        "RUST_LOG",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: tests touching the environment are serialized.
            unsafe { std::env::remove_var(var) };
        }
    }

    fn set_env(var: &str, value: &str) {
        // SAFETY: tests touching the environment are serialized.
        unsafe { std::env::set_var(var, value) };
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.file_path.is_none());
        assert!(!config.span_events);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        set_env("ROOMCRAWL_LOG_LEVEL", "debug");
        set_env("ROOMCRAWL_LOG_FORMAT", "json");
        set_env("ROOMCRAWL_LOG_FILE", "/tmp/roomcrawl-test.log");

        let config = LogConfig::new().with_env_overrides(false);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/tmp/roomcrawl-test.log"))
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_cli_level_wins_over_env() {
        clear_env();
        set_env("ROOMCRAWL_LOG", "trace");
        set_env("ROOMCRAWL_LOG_LEVEL", "trace");

        let config = LogConfig::new()
            .with_level(Level::INFO)
            .with_env_overrides(true);
        assert_eq!(config.level, Level::INFO);
        assert!(config.filter.is_none());

        let config = LogConfig::new().with_env_overrides(false);
        assert_eq!(config.filter.as_deref(), Some("trace"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_roomcrawl_log_beats_rust_log() {
        clear_env();
        set_env("RUST_LOG", "warn");
        set_env("ROOMCRAWL_LOG", "roomcrawl=debug");

        let config = LogConfig::new().with_env_overrides(false);
        assert_eq!(config.filter.as_deref(), Some("roomcrawl=debug"));
        clear_env();
    }

    #[test]
    fn test_file_appender_creates_log() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut appender = file_appender(&path);
        appender.write_all(b"worker 0 launched\n").unwrap();
        appender.flush().unwrap();
        assert!(
            std::fs::read_to_string(&path)
                .unwrap()
                .contains("worker 0 launched")
        );
    }
}
