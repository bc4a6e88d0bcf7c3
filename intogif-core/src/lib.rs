//! Intogif Core - Video to animated GIF conversion
//!
//! This crate orchestrates an ffmpeg-compatible transcoding engine to turn a
//! single video into a palette-optimized animated GIF: engine lifecycle,
//! input staging, the fixed transcode command, output retrieval and the
//! session state machine that ties them together.

pub mod config;
pub mod conversion;
pub mod engine;
pub mod session;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::IntogifConfig;
pub use conversion::{ConversionError, FailureKind, InputFile};
pub use engine::{EngineError, TranscodeEngine};
pub use session::{RenderedGif, SessionController, SessionError, SessionFailure, SessionState};

/// Errors that can bubble up from any intogif subsystem.
#[derive(Debug, thiserror::Error)]
pub enum IntogifError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Failed(#[from] SessionFailure),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntogifError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            IntogifError::Session(SessionError::EngineUnavailable { .. }) => {
                "The converter is unavailable".to_string()
            }
            IntogifError::Session(_) => "The conversion session has ended".to_string(),
            IntogifError::Failed(failure) => match failure {
                SessionFailure::EngineInit(error) => match error.as_ref() {
                    EngineError::CoreUnavailable { path, .. } => {
                        format!("ffmpeg could not be started from {}", path.display())
                    }
                    _ => failure.user_message().to_string(),
                },
                SessionFailure::Conversion(_) => failure.user_message().to_string(),
            },
            IntogifError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            IntogifError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, IntogifError::Configuration { .. })
    }

    /// Step the conversion failed at, if a conversion ran
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            IntogifError::Failed(failure) => failure.kind(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IntogifError>;
