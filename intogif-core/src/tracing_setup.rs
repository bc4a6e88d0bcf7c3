//! Tracing setup for intogif
//!
//! Console output follows the level picked on the command line and only
//! applies it to intogif's own targets; dependencies stay at `warn`. The
//! trace file of the last run records everything intogif emits, including
//! every line the engine printed.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run trace file inside the logs directory
pub const LAST_RUN_LOG: &str = "intogif-last-run.log";

/// Target of raw output read from the ffmpeg process
pub const ENGINE_OUTPUT_TARGET: &str = "intogif::engine";

/// Target engine log lines are mirrored under when a session logs them
pub const ENGINE_LOG_TARGET: &str = "intogif::engine_log";

const CRATE_TARGETS: [&str; 2] = ["intogif_core", "intogif_cli"];

#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("Cannot create logs directory {path}: {source}")]
    LogsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create trace file {path}: {source}")]
    TraceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracing subscriber already installed: {0}")]
    Install(#[from] TryInitError),
}

/// Initialize tracing with dual output: console (user level) + trace file
///
/// `RUST_LOG` replaces the console directives when set.
///
/// # Errors
/// - `TracingSetupError::LogsDir` - Logs directory cannot be created
/// - `TracingSetupError::TraceFile` - Trace file cannot be opened
/// - `TracingSetupError::Install` - A global subscriber is already installed
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<(), TracingSetupError> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));

    create_dir_all(logs_path).map_err(|source| TracingSetupError::LogsDir {
        path: logs_path.to_path_buf(),
        source,
    })?;

    let log_file_path = logs_path.join(LAST_RUN_LOG);
    let log_file = File::create(&log_file_path).map_err(|source| TracingSetupError::TraceFile {
        path: log_file_path.clone(),
        source,
    })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    // Engine output is interleaved with job state changes by thread
    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(trace_file_directives()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={}, trace_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(())
}

/// `warn` for everything, `level` for intogif and the engine targets
fn console_directives(level: Level) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        CRATE_TARGETS
            .iter()
            .chain([&ENGINE_OUTPUT_TARGET, &ENGINE_LOG_TARGET])
            .map(|target| format!("{target}={level}")),
    );
    directives.join(",")
}

/// `info` for dependencies, full trace for intogif and the engine targets
fn trace_file_directives() -> String {
    let mut directives = vec!["info".to_string()];
    directives.extend(CRATE_TARGETS.iter().map(|target| format!("{target}=trace")));
    directives.push(format!("{ENGINE_OUTPUT_TARGET}=trace"));
    directives.push(format!("{ENGINE_LOG_TARGET}=trace"));
    directives.join(",")
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warnings, including failed conversions
    Warn,
    /// Session and job milestones
    Info,
    /// Job state changes and engine output
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use intogif_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}
