//! In-memory engine for tests and dry runs
//!
//! Behaves like a loaded ffmpeg build without decoding anything: staged
//! files live in a `HashMap`, `run` checks that its `-i` input exists and
//! writes a GIF-headed payload under the last argument. Every step can be
//! scripted to fail, be delayed, or be held behind a [`Gate`] so tests can
//! interleave submissions deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};

use super::{
    EngineError, EngineFactory, EngineOptions, EngineResult, LogLine, TranscodeEngine,
    validate_file_name,
};
use crate::config::SimulationConfig;

/// Header written at the start of every simulated output
pub const SIMULATED_GIF_HEADER: &[u8] = b"GIF89a";

/// Manually opened barrier.
///
/// Each `open(n)` lets `n` waiters through; waiters arriving later consume
/// leftover permits.
#[derive(Debug, Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn open(&self, passes: usize) {
        self.permits.add_permits(passes);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Scripted result of one `run` call
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Write the output and report success
    Succeed,
    /// Report failure with the given diagnostic
    Fail(String),
    /// Report success without writing any output
    OmitOutput,
}

/// Behavior of simulated engines.
///
/// Run outcomes are consumed in order, one per `run` call; runs beyond the
/// scripted list succeed.
#[derive(Debug, Clone)]
pub struct SimulationScript {
    load_failure: Option<String>,
    load_delay: Duration,
    load_gate: Option<Gate>,
    stage_failure: Option<String>,
    run_outcomes: Vec<RunOutcome>,
    run_delay: Duration,
    run_gate: Option<Gate>,
    progress: Vec<f64>,
    log_lines: Vec<String>,
}

impl SimulationScript {
    /// Script where every step succeeds immediately
    pub fn new() -> Self {
        Self {
            load_failure: None,
            load_delay: Duration::ZERO,
            load_gate: None,
            stage_failure: None,
            run_outcomes: Vec::new(),
            run_delay: Duration::ZERO,
            run_gate: None,
            progress: vec![0.0, 0.5, 1.0],
            log_lines: vec![
                "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'input.mov':".to_string(),
                "  Duration: 00:00:02.00, start: 0.000000, bitrate: 1205 kb/s".to_string(),
                "Output #0, gif, to 'output.gif':".to_string(),
            ],
        }
    }

    /// Script with the delays from a simulation configuration
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new()
            .with_load_delay(config.load_delay)
            .with_run_delay(config.run_delay)
    }

    pub fn with_load_failure(mut self, reason: impl Into<String>) -> Self {
        self.load_failure = Some(reason.into());
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Hold `load` until the gate is opened
    pub fn with_load_gate(mut self, gate: Gate) -> Self {
        self.load_gate = Some(gate);
        self
    }

    /// Make every `write_file` fail
    pub fn with_stage_failure(mut self, reason: impl Into<String>) -> Self {
        self.stage_failure = Some(reason.into());
        self
    }

    pub fn with_run_outcomes(mut self, outcomes: Vec<RunOutcome>) -> Self {
        self.run_outcomes = outcomes;
        self
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Hold every `run` until the gate lets it through
    pub fn with_run_gate(mut self, gate: Gate) -> Self {
        self.run_gate = Some(gate);
        self
    }

    /// Progress ratios reported by each run, in order
    pub fn with_progress(mut self, ratios: Vec<f64>) -> Self {
        self.progress = ratios;
        self
    }

    pub fn with_log_lines(mut self, lines: Vec<String>) -> Self {
        self.log_lines = lines;
        self
    }
}

impl Default for SimulationScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared record of what simulated engines were asked to do.
#[derive(Debug, Clone, Default)]
pub struct SimulationProbe {
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    engines_created: usize,
    load_calls: usize,
    exit_calls: usize,
    writes: Vec<String>,
    reads: Vec<String>,
    removals: Vec<String>,
    runs: Vec<Vec<String>>,
}

impl SimulationProbe {
    pub fn engines_created(&self) -> usize {
        self.state.lock().engines_created
    }

    pub fn load_calls(&self) -> usize {
        self.state.lock().load_calls
    }

    pub fn exit_calls(&self) -> usize {
        self.state.lock().exit_calls
    }

    /// Names passed to `write_file`, in call order
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Names passed to `read_file`, in call order
    pub fn reads(&self) -> Vec<String> {
        self.state.lock().reads.clone()
    }

    /// Names passed to `remove_file`, in call order
    pub fn removals(&self) -> Vec<String> {
        self.state.lock().removals.clone()
    }

    /// Argument vectors passed to `run`, in call order
    pub fn runs(&self) -> Vec<Vec<String>> {
        self.state.lock().runs.clone()
    }

    fn record(&self, update: impl FnOnce(&mut ProbeState)) {
        update(&mut self.state.lock());
    }
}

/// Builds [`SimulatedEngine`]s sharing one script and probe
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngineFactory {
    script: SimulationScript,
    probe: SimulationProbe,
}

impl SimulatedEngineFactory {
    pub fn new(script: SimulationScript) -> Self {
        Self {
            script,
            probe: SimulationProbe::default(),
        }
    }

    pub fn probe(&self) -> SimulationProbe {
        self.probe.clone()
    }
}

impl EngineFactory for SimulatedEngineFactory {
    fn create(&self, options: EngineOptions) -> Arc<dyn TranscodeEngine> {
        Arc::new(SimulatedEngine::new(
            self.script.clone(),
            self.probe.clone(),
            options,
        ))
    }
}

/// In-memory [`TranscodeEngine`]
pub struct SimulatedEngine {
    script: SimulationScript,
    probe: SimulationProbe,
    options: EngineOptions,
    files: Mutex<HashMap<String, Bytes>>,
    loaded: AtomicBool,
    running: AtomicBool,
    runs_started: AtomicUsize,
    terminated: watch::Sender<bool>,
}

impl SimulatedEngine {
    pub fn new(script: SimulationScript, probe: SimulationProbe, options: EngineOptions) -> Self {
        probe.record(|state| state.engines_created += 1);
        let (terminated, _) = watch::channel(false);
        Self {
            script,
            probe,
            options,
            files: Mutex::new(HashMap::new()),
            loaded: AtomicBool::new(false),
            running: AtomicBool::new(false),
            runs_started: AtomicUsize::new(0),
            terminated,
        }
    }

    fn ensure_loaded(&self) -> EngineResult<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(EngineError::NotLoaded)
        }
    }

    fn log(&self, kind: &str, message: impl Into<String>) {
        self.options.sinks.log(LogLine::new(kind, message));
    }

    async fn hold_run(&self) {
        if let Some(gate) = &self.script.run_gate {
            gate.pass().await;
        }
        if !self.script.run_delay.is_zero() {
            tokio::time::sleep(self.script.run_delay).await;
        }
    }
}

#[async_trait]
impl TranscodeEngine for SimulatedEngine {
    async fn load(&self) -> EngineResult<()> {
        self.probe.record(|state| state.load_calls += 1);
        self.log("info", "load ffmpeg-core");

        if let Some(gate) = &self.script.load_gate {
            gate.pass().await;
        }
        if !self.script.load_delay.is_zero() {
            tokio::time::sleep(self.script.load_delay).await;
        }

        if let Some(reason) = &self.script.load_failure {
            return Err(EngineError::CoreUnavailable {
                path: self.options.core_path.clone(),
                reason: reason.clone(),
            });
        }

        self.loaded.store(true, Ordering::SeqCst);
        self.log("info", "ffmpeg-core loaded");
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn write_file(&self, name: &str, data: Bytes) -> EngineResult<()> {
        self.ensure_loaded()?;
        validate_file_name(name)?;
        self.probe.record(|state| state.writes.push(name.to_string()));

        if let Some(reason) = &self.script.stage_failure {
            return Err(EngineError::Io {
                operation: "write",
                name: name.to_string(),
                source: std::io::Error::other(reason.clone()),
            });
        }

        self.files.lock().insert(name.to_string(), data);
        Ok(())
    }

    async fn read_file(&self, name: &str) -> EngineResult<Bytes> {
        self.ensure_loaded()?;
        self.probe.record(|state| state.reads.push(name.to_string()));

        self.files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::FileNotFound {
                name: name.to_string(),
            })
    }

    async fn remove_file(&self, name: &str) -> EngineResult<()> {
        self.ensure_loaded()?;
        self.probe.record(|state| state.removals.push(name.to_string()));
        self.files.lock().remove(name);
        Ok(())
    }

    async fn run(&self, args: &[String]) -> EngineResult<()> {
        self.ensure_loaded()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }
        let _running = RunningFlag(&self.running);

        let index = self.runs_started.fetch_add(1, Ordering::SeqCst);
        self.probe.record(|state| state.runs.push(args.to_vec()));
        self.log("info", format!("run FFmpeg command: {}", args.join(" ")));

        let mut terminated = self.terminated.subscribe();
        tokio::select! {
            _ = self.hold_run() => {}
            _ = terminated.wait_for(|done| *done) => return Err(EngineError::Terminated),
        }

        let input_name = args
            .iter()
            .position(|arg| arg == "-i")
            .and_then(|i| args.get(i + 1));
        let input = input_name.and_then(|name| self.files.lock().get(name).cloned());
        let Some(input) = input else {
            let name = input_name.map(String::as_str).unwrap_or("<none>");
            self.log("fferr", format!("{name}: No such file or directory"));
            return Err(EngineError::RunFailed {
                reason: format!("input {name} not found"),
            });
        };

        for line in &self.script.log_lines {
            self.log("fferr", line.clone());
        }
        for ratio in &self.script.progress {
            self.options.sinks.progress(*ratio);
        }

        let outcome = self
            .script
            .run_outcomes
            .get(index)
            .cloned()
            .unwrap_or(RunOutcome::Succeed);

        match outcome {
            RunOutcome::Fail(reason) => {
                self.log("fferr", reason.clone());
                Err(EngineError::RunFailed {
                    reason: format!("ffmpeg exited with code 1: {reason}"),
                })
            }
            RunOutcome::OmitOutput => Ok(()),
            RunOutcome::Succeed => {
                if let Some(output_name) = args.last() {
                    let mut output = BytesMut::with_capacity(SIMULATED_GIF_HEADER.len() + input.len());
                    output.extend_from_slice(SIMULATED_GIF_HEADER);
                    output.extend_from_slice(&input);
                    self.files.lock().insert(output_name.clone(), output.freeze());
                }
                Ok(())
            }
        }
    }

    fn exit(&self) {
        self.probe.record(|state| state.exit_calls += 1);
        self.loaded.store(false, Ordering::SeqCst);
        self.terminated.send_replace(true);
        self.files.lock().clear();
    }
}

/// Clears the running flag when a run ends, however it ends
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio_test::assert_ok;

    use super::*;
    use crate::engine::EngineSinks;

    fn engine(script: SimulationScript) -> (Arc<dyn TranscodeEngine>, SimulationProbe) {
        let factory = SimulatedEngineFactory::new(script);
        let options = EngineOptions {
            log: false,
            core_path: PathBuf::from("simulated"),
            sinks: EngineSinks::discard(),
        };
        (factory.create(options), factory.probe())
    }

    fn args(input: &str) -> Vec<String> {
        vec!["-i".to_string(), input.to_string(), "output.gif".to_string()]
    }

    #[tokio::test]
    async fn test_operations_require_load() {
        let (engine, _probe) = engine(SimulationScript::new());

        assert!(!engine.is_loaded());
        assert!(matches!(
            engine.write_file("input.mov", Bytes::from_static(b"x")).await,
            Err(EngineError::NotLoaded)
        ));
        assert!(matches!(
            engine.read_file("output.gif").await,
            Err(EngineError::NotLoaded)
        ));
        assert!(matches!(
            engine.run(&args("input.mov")).await,
            Err(EngineError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_run_writes_gif_output() {
        let (engine, probe) = engine(SimulationScript::new());
        assert_ok!(engine.load().await);
        assert_ok!(
            engine
                .write_file("input.mov", Bytes::from_static(b"movie"))
                .await
        );
        assert_ok!(engine.run(&args("input.mov")).await);

        let output = engine.read_file("output.gif").await.unwrap();
        assert!(output.starts_with(SIMULATED_GIF_HEADER));
        assert!(output.ends_with(b"movie"));
        assert_eq!(probe.runs(), vec![args("input.mov")]);
    }

    #[tokio::test]
    async fn test_remove_file_is_idempotent() {
        let (engine, probe) = engine(SimulationScript::new());
        assert_ok!(engine.load().await);
        assert_ok!(engine.write_file("input.mov", Bytes::from_static(b"x")).await);

        assert_ok!(engine.remove_file("input.mov").await);
        assert_ok!(engine.remove_file("input.mov").await);
        assert!(matches!(
            engine.read_file("input.mov").await,
            Err(EngineError::FileNotFound { .. })
        ));
        assert_eq!(probe.removals().len(), 2);
    }

    #[tokio::test]
    async fn test_run_without_input_fails() {
        let (engine, _probe) = engine(SimulationScript::new());
        assert_ok!(engine.load().await);

        let result = engine.run(&args("missing.mov")).await;
        assert!(matches!(result, Err(EngineError::RunFailed { .. })));
    }

    #[tokio::test]
    async fn test_scripted_outcomes_apply_in_order() {
        let script = SimulationScript::new().with_run_outcomes(vec![
            RunOutcome::Fail("Invalid data found when processing input".to_string()),
            RunOutcome::OmitOutput,
        ]);
        let (engine, _probe) = engine(script);
        assert_ok!(engine.load().await);
        assert_ok!(engine.write_file("input.mov", Bytes::from_static(b"x")).await);

        assert!(engine.run(&args("input.mov")).await.is_err());
        assert_ok!(engine.run(&args("input.mov")).await);
        assert!(matches!(
            engine.read_file("output.gif").await,
            Err(EngineError::FileNotFound { .. })
        ));
        assert_ok!(engine.run(&args("input.mov")).await);
        assert_ok!(engine.read_file("output.gif").await);
    }

    #[tokio::test]
    async fn test_exit_terminates_running_command() {
        let gate = Gate::new();
        let (engine, probe) = engine(SimulationScript::new().with_run_gate(gate));
        assert_ok!(engine.load().await);
        assert_ok!(engine.write_file("input.mov", Bytes::from_static(b"x")).await);

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(&args("input.mov")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        engine.exit();
        let result = running.await.unwrap();
        assert!(matches!(result, Err(EngineError::Terminated)));
        assert!(!engine.is_loaded());
        assert_eq!(probe.exit_calls(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_reports_core_path() {
        let (engine, _probe) = engine(SimulationScript::new().with_load_failure("wasm trap"));

        match engine.load().await {
            Err(EngineError::CoreUnavailable { path, reason }) => {
                assert_eq!(path, PathBuf::from("simulated"));
                assert_eq!(reason, "wasm trap");
            }
            other => panic!("unexpected load result: {other:?}"),
        }
        assert!(!engine.is_loaded());
    }
}
