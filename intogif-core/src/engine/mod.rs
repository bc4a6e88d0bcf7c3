//! Transcoding engine abstraction
//!
//! The orchestration layer only ever talks to a [`TranscodeEngine`]. Two
//! backends exist: [`ProcessEngine`] drives a native ffmpeg binary, and
//! [`SimulatedEngine`] is an in-memory stand-in for tests and dry runs.

pub mod handle;
pub mod process;
pub mod progress;
pub mod simulated;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use handle::EngineHandle;
pub use process::{ProcessEngine, ProcessEngineFactory};
pub use progress::ProgressTracker;
pub use simulated::{
    Gate, RunOutcome, SimulatedEngine, SimulatedEngineFactory, SimulationProbe, SimulationScript,
};

/// Abstraction over an embedded transcoding engine.
///
/// Mirrors the capability set of an ffmpeg build running in its own worker
/// context: it must be loaded before use, exposes a private name-to-bytes
/// filesystem, runs one command at a time and reports log lines and progress
/// through the sinks it was constructed with.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Bring the engine into a usable state.
    ///
    /// # Errors
    /// - `EngineError::CoreUnavailable` - Engine core could not be initialized
    async fn load(&self) -> EngineResult<()>;

    /// Check if `load` has completed and `exit` has not been called since
    fn is_loaded(&self) -> bool;

    /// Store `data` under `name` in the engine filesystem.
    ///
    /// # Errors
    /// - `EngineError::NotLoaded` - Engine is not loaded
    /// - `EngineError::InvalidName` - Name is empty or contains a path separator
    /// - `EngineError::Io` - Underlying storage failed
    async fn write_file(&self, name: &str, data: Bytes) -> EngineResult<()>;

    /// Read the file stored under `name` from the engine filesystem.
    ///
    /// # Errors
    /// - `EngineError::NotLoaded` - Engine is not loaded
    /// - `EngineError::FileNotFound` - No file with that name exists
    async fn read_file(&self, name: &str) -> EngineResult<Bytes>;

    /// Remove `name` from the engine filesystem; removing an absent file succeeds.
    ///
    /// # Errors
    /// - `EngineError::NotLoaded` - Engine is not loaded
    /// - `EngineError::Io` - Underlying storage failed
    async fn remove_file(&self, name: &str) -> EngineResult<()>;

    /// Run one engine command with the given arguments.
    ///
    /// # Errors
    /// - `EngineError::NotLoaded` - Engine is not loaded
    /// - `EngineError::Busy` - Another command is still running
    /// - `EngineError::RunFailed` - Command reported failure
    /// - `EngineError::Terminated` - `exit` was called while running
    async fn run(&self, args: &[String]) -> EngineResult<()>;

    /// Release all engine resources and terminate any running command.
    fn exit(&self);
}

/// Builds engine instances bound to a given set of options.
pub trait EngineFactory: Send + Sync {
    fn create(&self, options: EngineOptions) -> Arc<dyn TranscodeEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(EngineOptions) -> Arc<dyn TranscodeEngine> + Send + Sync,
{
    fn create(&self, options: EngineOptions) -> Arc<dyn TranscodeEngine> {
        self(options)
    }
}

/// Fixed construction-time configuration of an engine instance.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Mirror engine output into the application's own logs
    pub log: bool,
    /// Location of the engine core (the ffmpeg binary for `ProcessEngine`)
    pub core_path: PathBuf,
    /// Event sinks the engine reports through
    pub sinks: EngineSinks,
}

/// Single log line emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Source of the line, e.g. `info`, `fferr`, `ffout`
    pub kind: String,
    pub message: String,
}

impl LogLine {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Progress notification from the engine.
///
/// The ratio is nominally within `0.0..=1.0` but engines may report values
/// outside that range or going backwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub ratio: f64,
}

pub type LogCallback = Arc<dyn Fn(LogLine) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(ProgressSample) + Send + Sync>;

/// Log and progress sinks registered with an engine at construction.
#[derive(Clone)]
pub struct EngineSinks {
    pub on_log: LogCallback,
    pub on_progress: ProgressCallback,
}

impl EngineSinks {
    pub fn new(
        on_log: impl Fn(LogLine) + Send + Sync + 'static,
        on_progress: impl Fn(ProgressSample) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_log: Arc::new(on_log),
            on_progress: Arc::new(on_progress),
        }
    }

    /// Sinks that drop every event
    pub fn discard() -> Self {
        Self::new(|_| {}, |_| {})
    }

    pub fn log(&self, line: LogLine) {
        (self.on_log)(line);
    }

    pub fn progress(&self, ratio: f64) {
        (self.on_progress)(ProgressSample { ratio });
    }
}

impl fmt::Debug for EngineSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSinks").finish_non_exhaustive()
    }
}

/// Errors reported by engines and the engine handle
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is not loaded")]
    NotLoaded,

    #[error("Engine load was already attempted on this handle")]
    LoadAlreadyAttempted,

    #[error("Engine core unavailable at {path}: {reason}")]
    CoreUnavailable { path: PathBuf, reason: String },

    #[error("Invalid engine file name: {name:?}")]
    InvalidName { name: String },

    #[error("File not found in engine filesystem: {name}")]
    FileNotFound { name: String },

    #[error("File in engine filesystem is empty: {name}")]
    EmptyFile { name: String },

    #[error("I/O error during {operation} of {name}: {source}")]
    Io {
        operation: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine command failed: {reason}")]
    RunFailed { reason: String },

    #[error("Engine is already running a command")]
    Busy,

    #[error("Engine was terminated")]
    Terminated,
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Reject names that could escape the engine filesystem.
///
/// # Errors
/// - `EngineError::InvalidName` - Empty name, `.`/`..`, or a path separator
pub fn validate_file_name(name: &str) -> EngineResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(EngineError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_display() {
        let line = LogLine::new("fferr", "frame=  10 fps=0.0");
        assert_eq!(line.to_string(), "[fferr] frame=  10 fps=0.0");
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("input.mov").is_ok());
        assert!(validate_file_name("noext").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("a/b.mov").is_err());
        assert!(validate_file_name("a\\b.mov").is_err());
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::FileNotFound {
            name: "output.gif".to_string(),
        };
        assert!(err.to_string().contains("output.gif"));

        let err = EngineError::RunFailed {
            reason: "exit code 1".to_string(),
        };
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_sinks_forward_events() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let ratios = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sinks = {
            let seen = Arc::clone(&seen);
            let ratios = Arc::clone(&ratios);
            EngineSinks::new(
                move |line| seen.lock().push(line.to_string()),
                move |sample| ratios.lock().push(sample.ratio),
            )
        };

        sinks.log(LogLine::new("info", "hello"));
        sinks.progress(0.25);

        assert_eq!(*seen.lock(), vec!["[info] hello".to_string()]);
        assert_eq!(*ratios.lock(), vec![0.25]);
    }
}
