//! Conversion sessions
//!
//! [`SessionController`] owns the engine for the life of a session, starts a
//! conversion whenever a file is pending and the engine is ready, and
//! publishes [`SessionSnapshot`]s describing the outcome.

pub mod controller;
pub mod sinks;
pub mod state;

pub use controller::{SessionController, SessionError};
pub use sinks::{LogSink, MemoryLogSink, NullLogSink, TracingLogSink};
pub use state::{GIF_MIME_TYPE, RenderedGif, SessionFailure, SessionSnapshot, SessionState};
