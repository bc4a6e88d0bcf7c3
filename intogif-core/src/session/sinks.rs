//! Destinations for the session's engine log stream

use parking_lot::Mutex;

use crate::tracing_setup::ENGINE_LOG_TARGET;

/// Append-only receiver of `[kind] message` engine log lines.
///
/// Called from engine output tasks, so implementations must be cheap and
/// must not block.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

/// Keeps every line in memory
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Check if any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Forwards lines to `tracing` at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&self, line: &str) {
        tracing::debug!(target: ENGINE_LOG_TARGET, "{}", line);
    }
}

/// Drops every line
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn append(&self, _line: &str) {}
}
