//! Session controller: owns the engine and drives conversions
//!
//! A session loads one engine in the background and turns each submitted
//! video into a GIF. The only rule deciding when a job starts lives in
//! [`Shared::evaluate`]: a file is pending and the engine is ready. It is
//! re-checked whenever either side changes, so a file submitted while the
//! engine is still loading starts as soon as loading finishes.
//!
//! Every started job gets a fresh [`Generation`]. Results, progress and
//! failures are applied only while their generation is still current, which
//! makes late results of superseded jobs harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::sinks::LogSink;
use super::state::{RenderedGif, SessionFailure, SessionSnapshot, SessionState};
use crate::config::{EngineConfig, IntogifConfig};
use crate::conversion::{ConversionError, ConversionJob, Generation, InputFile};
use crate::engine::{
    EngineError, EngineFactory, EngineHandle, EngineResult, EngineSinks, LogLine,
    ProcessEngineFactory, ProgressSample, SimulatedEngineFactory, SimulationScript,
};

/// Errors returned by session operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session was already started")]
    AlreadyStarted,

    #[error("Session has been stopped")]
    Stopped,

    #[error("Engine is unavailable: {reason}")]
    EngineUnavailable { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

struct Inner {
    lifecycle: Lifecycle,
    engine: Option<Arc<EngineHandle>>,
    engine_failure: Option<Arc<EngineError>>,
    pending: Option<InputFile>,
    /// Generation of the latest started job; advanced on stop
    current: Generation,
    /// Generation of the job currently holding the engine lease
    engine_owner: Option<Generation>,
    snapshot: SessionSnapshot,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    config: EngineConfig,
    factory: Arc<dyn EngineFactory>,
    log_sink: Arc<dyn LogSink>,
    stopped: AtomicBool,
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Runs video-to-GIF conversions against one engine for its whole lifetime.
///
/// Operations that spawn work (`start`, `submit`) must be called from
/// within a tokio runtime. Dropping the controller stops it.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        engine_config: EngineConfig,
        factory: Arc<dyn EngineFactory>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                config: engine_config,
                factory,
                log_sink,
                stopped: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    lifecycle: Lifecycle::NotStarted,
                    engine: None,
                    engine_failure: None,
                    pending: None,
                    current: Generation::default(),
                    engine_owner: None,
                    snapshot: SessionSnapshot::default(),
                    tasks: Vec::new(),
                }),
                snapshot_tx,
            }),
        }
    }

    /// Controller using the simulated engine when simulation is enabled,
    /// the ffmpeg binary otherwise
    pub fn from_config(config: &IntogifConfig, log_sink: Arc<dyn LogSink>) -> Self {
        let factory: Arc<dyn EngineFactory> = if config.simulation.enabled {
            Arc::new(SimulatedEngineFactory::new(SimulationScript::from_config(
                &config.simulation,
            )))
        } else {
            Arc::new(ProcessEngineFactory)
        };
        Self::new(config.engine.clone(), factory, log_sink)
    }

    /// Create the engine and begin loading it in the background.
    ///
    /// # Errors
    /// - `SessionError::AlreadyStarted` - `start` was called before
    /// - `SessionError::Stopped` - Session has been stopped
    pub fn start(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        match inner.lifecycle {
            Lifecycle::Running => return Err(SessionError::AlreadyStarted),
            Lifecycle::Stopped => return Err(SessionError::Stopped),
            Lifecycle::NotStarted => {}
        }
        inner.lifecycle = Lifecycle::Running;

        let engine = Arc::new(EngineHandle::create(
            self.shared.factory.as_ref(),
            &self.shared.config,
            self.shared.engine_sinks(),
        ));
        inner.engine = Some(Arc::clone(&engine));

        let weak = Arc::downgrade(&self.shared);
        inner.tasks.push(tokio::spawn(async move {
            let result = engine.load().await;
            if let Some(shared) = weak.upgrade() {
                shared.on_engine_loaded(result);
            }
        }));

        info!(
            core = %self.shared.config.core_path.display(),
            "Session started, loading engine"
        );
        Ok(())
    }

    /// Submit a file for conversion, or `None` to drop a file that has not
    /// started converting yet.
    ///
    /// The latest submission wins: a running job is superseded and its
    /// result discarded.
    ///
    /// # Errors
    /// - `SessionError::Stopped` - Session has been stopped
    /// - `SessionError::EngineUnavailable` - Engine failed to load
    pub fn submit(&self, file: Option<InputFile>) -> Result<(), SessionError> {
        let mut inner = self.shared.inner.lock();
        if inner.lifecycle == Lifecycle::Stopped {
            return Err(SessionError::Stopped);
        }
        if let Some(error) = &inner.engine_failure {
            return Err(SessionError::EngineUnavailable {
                reason: error.to_string(),
            });
        }

        match file {
            Some(input) => {
                debug!(
                    input = %input.display_name(),
                    bytes = input.len(),
                    "File submitted"
                );
                inner.pending = Some(input);
                self.shared.evaluate(&mut inner);
            }
            None => {
                if inner.pending.take().is_some() {
                    debug!("Pending file cleared");
                }
            }
        }
        Ok(())
    }

    /// End the session.
    ///
    /// Releases the engine without waiting for running work, which is
    /// aborted. Idempotent; also run on drop. The snapshot is frozen from
    /// here on.
    pub fn stop(&self) {
        let (engine, tasks) = {
            let mut inner = self.shared.inner.lock();
            if inner.lifecycle == Lifecycle::Stopped {
                return;
            }
            inner.lifecycle = Lifecycle::Stopped;
            self.shared.stopped.store(true, Ordering::SeqCst);
            inner.current = inner.current.next();
            inner.pending = None;
            inner.engine_owner = None;
            (inner.engine.take(), std::mem::take(&mut inner.tasks))
        };

        info!("Stopping session");
        for task in tasks {
            task.abort();
        }
        if let Some(engine) = engine {
            engine.dispose();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.shared.snapshot_tx.borrow().state
    }

    pub fn progress(&self) -> Option<f64> {
        self.shared.snapshot_tx.borrow().progress
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the session is `done` or `error`.
    ///
    /// Returns immediately if it already is. Never resolves for a session
    /// that is stopped before settling; callers bound it with a timeout.
    pub async fn settled(&self) -> SessionSnapshot {
        let mut receiver = self.subscribe();
        let settled = match receiver.wait_for(|snapshot| snapshot.state.is_settled()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    /// Sinks forwarding engine events into this session.
    ///
    /// They hold a weak reference: the engine they are registered with is
    /// owned by the session.
    fn engine_sinks(self: &Arc<Self>) -> EngineSinks {
        let on_log = {
            let weak = Arc::downgrade(self);
            move |line: LogLine| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_engine_log(&line);
                }
            }
        };
        let on_progress = {
            let weak = Arc::downgrade(self);
            move |sample: ProgressSample| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_progress(sample.ratio);
                }
            }
        };
        EngineSinks::new(on_log, on_progress)
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(inner.snapshot.clone());
    }

    /// Start a job if a file is pending and the engine is ready
    fn evaluate(self: &Arc<Self>, inner: &mut Inner) {
        if inner.lifecycle != Lifecycle::Running {
            return;
        }
        let Some(engine) = inner
            .engine
            .as_ref()
            .filter(|engine| engine.is_ready())
            .cloned()
        else {
            return;
        };
        let Some(input) = inner.pending.take() else {
            return;
        };

        let generation = inner.current.next();
        inner.current = generation;
        inner.snapshot = SessionSnapshot {
            state: SessionState::Processing,
            progress: None,
            output: None,
            failure: None,
            generation,
        };
        self.publish(inner);

        info!(job = %generation, input = %input.display_name(), "Starting job");
        inner.tasks.retain(|task| !task.is_finished());
        inner.tasks.push(tokio::spawn(drive_job(
            Arc::downgrade(self),
            engine,
            generation,
            input,
        )));
    }

    fn on_engine_loaded(self: &Arc<Self>, result: EngineResult<()>) {
        let mut inner = self.inner.lock();
        if inner.lifecycle == Lifecycle::Stopped {
            return;
        }

        match result {
            Ok(()) => {
                info!("Engine ready");
                self.evaluate(&mut inner);
            }
            Err(error) => {
                error!("Engine failed to load: {}", error);
                let message = format!("[error] {error}");
                let error = Arc::new(error);
                inner.engine_failure = Some(Arc::clone(&error));
                inner.snapshot.state = SessionState::Error;
                inner.snapshot.progress = None;
                inner.snapshot.output = None;
                inner.snapshot.failure = Some(SessionFailure::EngineInit(error));
                self.publish(&inner);
                drop(inner);
                self.log_sink.append(&message);
            }
        }
    }

    fn on_engine_log(&self, line: &LogLine) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.log_sink.append(&line.to_string());
    }

    fn on_progress(&self, ratio: f64) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.snapshot.state.is_processing()
            || inner.engine_owner != Some(inner.current)
        {
            return;
        }
        inner.snapshot.progress = Some(ratio);
        self.publish(&inner);
    }

    /// Apply a job's result if the job is still current
    fn complete(&self, generation: Generation, result: Result<Bytes, ConversionError>) {
        let mut inner = self.inner.lock();
        if inner.engine_owner == Some(generation) {
            inner.engine_owner = None;
        }
        if inner.lifecycle == Lifecycle::Stopped || inner.current != generation {
            debug!(
                job = %generation,
                current = %inner.current,
                succeeded = result.is_ok(),
                "Discarding result of superseded job"
            );
            return;
        }

        match result {
            Ok(bytes) => {
                let gif = RenderedGif::new(bytes);
                info!(
                    job = %generation,
                    output = %gif.resource_uri(),
                    bytes = gif.len(),
                    "GIF ready"
                );
                inner.snapshot.state = SessionState::Done;
                inner.snapshot.output = Some(gif);
                inner.snapshot.failure = None;
                self.publish(&inner);
            }
            Err(error) => {
                error!(job = %generation, kind = %error.kind(), "Conversion failed: {}", error);
                for line in error.diagnostics() {
                    debug!(job = %generation, "{}", line);
                }
                let message = format!("[error] {error}");
                inner.snapshot.state = SessionState::Error;
                inner.snapshot.output = None;
                inner.snapshot.failure = Some(SessionFailure::Conversion(Arc::new(error)));
                self.publish(&inner);
                drop(inner);
                self.log_sink.append(&message);
            }
        }
    }
}

/// Run one job under the engine lease and report its result
async fn drive_job(
    session: Weak<Shared>,
    engine: Arc<EngineHandle>,
    generation: Generation,
    input: InputFile,
) {
    let _lease = engine.lease().await;
    {
        let Some(shared) = session.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock();
        if inner.lifecycle == Lifecycle::Stopped || inner.current != generation {
            debug!(job = %generation, "Skipping superseded job before staging");
            return;
        }
        inner.engine_owner = Some(generation);
    }

    let mut job = ConversionJob::new(generation, input);
    let result = job.run(&engine).await;

    if let Some(shared) = session.upgrade() {
        shared.complete(generation, result);
    }
}
