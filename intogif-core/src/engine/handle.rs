//! Lifecycle owner for a single engine instance.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, info, warn};

use super::{
    EngineError, EngineFactory, EngineOptions, EngineResult, EngineSinks, LogLine,
    TranscodeEngine,
};
use crate::config::EngineConfig;

/// Lifecycle phase of an engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Constructed, `load` not called yet
    Created,
    /// `load` in progress
    Loading,
    /// Engine usable
    Ready,
    /// `load` failed; the handle can never become ready
    Failed,
    /// Released
    Disposed,
}

/// Owns one engine instance from construction to release.
///
/// The handle is the only path to the engine. It enforces the
/// load-at-most-once rule, releases the engine exactly once, and hands out
/// a lease so that only one job at a time touches the engine filesystem.
pub struct EngineHandle {
    engine: Arc<dyn TranscodeEngine>,
    phase: Mutex<EnginePhase>,
    lease: AsyncMutex<()>,
    log_tail: Arc<Mutex<LogTail>>,
}

impl EngineHandle {
    /// Construct an unready handle and register `sinks` with a new engine.
    ///
    /// Never blocks. Every log line passing through the log sink is also
    /// kept in a bounded tail so jobs can attach diagnostics to failures.
    pub fn create(factory: &dyn EngineFactory, config: &EngineConfig, sinks: EngineSinks) -> Self {
        let log_tail = Arc::new(Mutex::new(LogTail::new(config.log_tail_lines)));

        let on_log = {
            let log_tail = Arc::clone(&log_tail);
            let forward = sinks.on_log;
            Arc::new(move |line: LogLine| {
                log_tail.lock().push(line.to_string());
                forward(line);
            })
        };

        let options = EngineOptions {
            log: config.log,
            core_path: config.core_path.clone(),
            sinks: EngineSinks {
                on_log,
                on_progress: sinks.on_progress,
            },
        };

        debug!("Creating engine with core at {}", config.core_path.display());

        Self {
            engine: factory.create(options),
            phase: Mutex::new(EnginePhase::Created),
            lease: AsyncMutex::new(()),
            log_tail,
        }
    }

    /// Load the engine.
    ///
    /// # Errors
    /// - `EngineError::LoadAlreadyAttempted` - `load` was called before
    /// - `EngineError::Terminated` - Handle was disposed before loading finished
    /// - Any error from the engine's own `load`; the handle is then `Failed`
    pub async fn load(&self) -> EngineResult<()> {
        {
            let mut phase = self.phase.lock();
            if *phase != EnginePhase::Created {
                return Err(EngineError::LoadAlreadyAttempted);
            }
            *phase = EnginePhase::Loading;
        }

        let result = self.engine.load().await;

        let mut phase = self.phase.lock();
        let still_loading = *phase == EnginePhase::Loading;
        match result {
            Ok(()) if still_loading => {
                *phase = EnginePhase::Ready;
                info!("Engine loaded");
                Ok(())
            }
            Ok(()) => {
                // Disposed while loading: nobody else will release it
                drop(phase);
                warn!("Engine finished loading after release, shutting it down");
                self.engine.exit();
                Err(EngineError::Terminated)
            }
            Err(e) => {
                if still_loading {
                    *phase = EnginePhase::Failed;
                }
                Err(e)
            }
        }
    }

    /// Check if the engine is usable
    pub fn is_ready(&self) -> bool {
        *self.phase.lock() == EnginePhase::Ready
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.lock()
    }

    /// Release the engine.
    ///
    /// Idempotent. Only a ready engine is told to exit; disposing an unready
    /// handle just marks it released.
    pub fn dispose(&self) {
        let previous = {
            let mut phase = self.phase.lock();
            std::mem::replace(&mut *phase, EnginePhase::Disposed)
        };

        match previous {
            EnginePhase::Ready => {
                info!("Releasing engine");
                self.engine.exit();
            }
            EnginePhase::Disposed => {}
            other => debug!("Engine released in phase {:?}", other),
        }
    }

    /// Wait for exclusive use of the engine.
    ///
    /// Held by a job across its stage, transcode and retrieve steps.
    pub async fn lease(&self) -> AsyncMutexGuard<'_, ()> {
        self.lease.lock().await
    }

    /// Underlying engine, for use while holding a lease
    pub fn engine(&self) -> &dyn TranscodeEngine {
        self.engine.as_ref()
    }

    /// Position in the log stream; pass to `log_since` later
    pub fn log_mark(&self) -> u64 {
        self.log_tail.lock().next_seq
    }

    /// Log lines emitted since `mark` that are still retained
    pub fn log_since(&self, mark: u64) -> Vec<String> {
        self.log_tail.lock().since(mark)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Bounded, sequence-numbered buffer of recent log lines.
#[derive(Debug)]
struct LogTail {
    capacity: usize,
    next_seq: u64,
    lines: VecDeque<(u64, String)>,
}

impl LogTail {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    fn push(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back((seq, line));
    }

    fn since(&self, mark: u64) -> Vec<String> {
        self.lines
            .iter()
            .filter(|(seq, _)| *seq >= mark)
            .map(|(_, line)| line.clone())
            .collect()
    }
}
