//! Observable state of a conversion session

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::conversion::{ConversionError, FailureKind, Generation};
use crate::engine::EngineError;

/// MIME type of every rendered output
pub const GIF_MIME_TYPE: &str = "image/gif";

/// Session-level conversion state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No conversion attempted yet
    #[default]
    Initial,
    /// A conversion job is running
    Processing,
    /// The latest job produced an output
    Done,
    /// The latest job failed, or the engine could not be loaded
    Error,
}

impl SessionState {
    pub fn is_processing(&self) -> bool {
        matches!(self, SessionState::Processing)
    }

    /// Check if the latest submission has reached a result
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initial => "initial",
            SessionState::Processing => "processing",
            SessionState::Done => "done",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Animated image produced by a successful conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedGif {
    id: Uuid,
    bytes: Bytes,
}

impl RenderedGif {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mime_type(&self) -> &'static str {
        GIF_MIME_TYPE
    }

    /// Stable reference to this output, valid for the life of the value
    pub fn resource_uri(&self) -> String {
        format!("urn:uuid:{}", self.id)
    }

    /// Persist the image to `path`.
    ///
    /// # Errors
    /// - `std::io::Error` - File could not be written
    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::write(path, &self.bytes).await
    }
}

/// Failure recorded in the session snapshot.
///
/// Cheap to clone so snapshots can be published to every subscriber.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionFailure {
    #[error("Engine failed to initialize: {0}")]
    EngineInit(#[source] Arc<EngineError>),

    #[error("Conversion failed: {0}")]
    Conversion(#[source] Arc<ConversionError>),
}

impl SessionFailure {
    /// Classification of a conversion failure, `None` for engine init
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SessionFailure::EngineInit(_) => None,
            SessionFailure::Conversion(error) => Some(error.kind()),
        }
    }

    /// Generic indicator suitable for end users; details go to the logs
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionFailure::EngineInit(_) => "The converter could not be started",
            SessionFailure::Conversion(_) => "Something went wrong while converting this video",
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Latest progress ratio of the current job; `None` until the engine reports one
    pub progress: Option<f64>,
    pub output: Option<RenderedGif>,
    pub failure: Option<SessionFailure>,
    /// Generation of the most recently started job
    pub generation: Generation,
}

impl SessionSnapshot {
    pub fn is_done(&self) -> bool {
        self.state == SessionState::Done
    }

    pub fn is_error(&self) -> bool {
        self.state == SessionState::Error
    }
}
