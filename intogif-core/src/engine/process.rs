//! Engine backed by a native ffmpeg binary
//!
//! The engine filesystem is a private temporary directory created on load
//! and removed on exit. Commands run with that directory as working
//! directory, so staged names are plain relative paths.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use super::progress::ProgressTracker;
use crate::tracing_setup::ENGINE_OUTPUT_TARGET;
use super::{
    EngineError, EngineFactory, EngineOptions, EngineResult, EngineSinks, LogLine,
    TranscodeEngine, validate_file_name,
};

/// Builds [`ProcessEngine`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEngineFactory;

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, options: EngineOptions) -> Arc<dyn TranscodeEngine> {
        Arc::new(ProcessEngine::new(options))
    }
}

/// [`TranscodeEngine`] running the ffmpeg binary at `options.core_path`
pub struct ProcessEngine {
    options: EngineOptions,
    workdir: Mutex<Option<TempDir>>,
    running: AtomicBool,
    terminated: watch::Sender<bool>,
}

impl ProcessEngine {
    pub fn new(options: EngineOptions) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            options,
            workdir: Mutex::new(None),
            running: AtomicBool::new(false),
            terminated,
        }
    }

    fn workdir(&self) -> EngineResult<PathBuf> {
        self.workdir
            .lock()
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or(EngineError::NotLoaded)
    }

    fn log(&self, kind: &str, message: impl Into<String>) {
        let line = LogLine::new(kind, message);
        if self.options.log {
            tracing::debug!(target: ENGINE_OUTPUT_TARGET, "{}", line);
        }
        self.options.sinks.log(line);
    }

    /// Verify the ffmpeg binary runs and report its version line
    async fn probe_core(&self) -> EngineResult<String> {
        let core_path = &self.options.core_path;
        let output = Command::new(core_path)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::CoreUnavailable {
                path: core_path.clone(),
                reason: format!("failed to execute: {e}"),
            })?;

        if !output.status.success() {
            return Err(EngineError::CoreUnavailable {
                path: core_path.clone(),
                reason: format!("version check exited with {}", output.status),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl TranscodeEngine for ProcessEngine {
    async fn load(&self) -> EngineResult<()> {
        self.log(
            "info",
            format!("load ffmpeg-core from {}", self.options.core_path.display()),
        );

        let version = self.probe_core().await?;

        let dir = tempfile::Builder::new()
            .prefix("intogif-")
            .tempdir()
            .map_err(|e| EngineError::CoreUnavailable {
                path: self.options.core_path.clone(),
                reason: format!("failed to create engine filesystem: {e}"),
            })?;

        tracing::debug!("Engine filesystem at {}", dir.path().display());
        *self.workdir.lock() = Some(dir);
        self.log("info", format!("ffmpeg-core loaded: {version}"));
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.workdir.lock().is_some()
    }

    async fn write_file(&self, name: &str, data: Bytes) -> EngineResult<()> {
        validate_local_name(name)?;
        let dir = self.workdir()?;

        tokio::fs::write(dir.join(name), &data)
            .await
            .map_err(|source| EngineError::Io {
                operation: "write",
                name: name.to_string(),
                source,
            })
    }

    async fn read_file(&self, name: &str) -> EngineResult<Bytes> {
        validate_local_name(name)?;
        let dir = self.workdir()?;

        match tokio::fs::read(dir.join(name)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::FileNotFound {
                name: name.to_string(),
            }),
            Err(source) => Err(EngineError::Io {
                operation: "read",
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn remove_file(&self, name: &str) -> EngineResult<()> {
        validate_local_name(name)?;
        let dir = self.workdir()?;

        match tokio::fs::remove_file(dir.join(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(EngineError::Io {
                operation: "remove",
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn run(&self, args: &[String]) -> EngineResult<()> {
        let dir = self.workdir()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }
        let _running = RunningFlag(&self.running);

        self.log("info", format!("run FFmpeg command: {}", args.join(" ")));

        let mut cmd = Command::new(&self.options.core_path);
        cmd.current_dir(&dir)
            .arg("-nostdin")
            .arg("-y")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::RunFailed {
            reason: format!("failed to spawn {}: {e}", self.options.core_path.display()),
        })?;

        let stderr = child.stderr.take().ok_or_else(|| EngineError::RunFailed {
            reason: "ffmpeg stderr not captured".to_string(),
        })?;
        let sinks = self.options.sinks.clone();
        let mirror = self.options.log;
        let pump = tokio::spawn(async move { forward_engine_output(stderr, sinks, mirror).await });

        let mut terminated = self.terminated.subscribe();
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = terminated.wait_for(|done| *done) => None,
        };

        let Some(status) = status else {
            let _ = child.kill().await;
            pump.abort();
            return Err(EngineError::Terminated);
        };

        // Drain remaining output so the failure diagnostics are complete
        let _ = pump.await;

        let status = status.map_err(|source| EngineError::Io {
            operation: "wait",
            name: self.options.core_path.display().to_string(),
            source,
        })?;

        if !status.success() {
            return Err(EngineError::RunFailed {
                reason: format!("ffmpeg exited with {status}"),
            });
        }

        Ok(())
    }

    fn exit(&self) {
        self.terminated.send_replace(true);
        if let Some(dir) = self.workdir.lock().take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove engine filesystem {}: {}", path.display(), e);
            }
        }
    }
}

/// Forward ffmpeg stderr to the log and progress sinks.
///
/// ffmpeg terminates statistics lines with `\r`, so both `\r` and `\n`
/// end a line.
async fn forward_engine_output<R>(reader: R, sinks: EngineSinks, mirror: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut tracker = ProgressTracker::new();
    let mut pending: Vec<u8> = Vec::new();

    let mut emit = |raw: &[u8]| {
        let message = String::from_utf8_lossy(raw).into_owned();
        if message.trim().is_empty() {
            return;
        }
        if let Some(ratio) = tracker.observe(&message) {
            sinks.progress(ratio);
        }
        if mirror {
            tracing::debug!(target: ENGINE_OUTPUT_TARGET, "[fferr] {}", message);
        }
        sinks.log(LogLine::new("fferr", message));
    };

    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!("Failed to read engine output: {}", e);
                break;
            }
        };

        let consumed = chunk.len();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                emit(&pending);
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
        reader.consume(consumed);
    }

    emit(&pending);
}

/// Clears the running flag when a run ends, however it ends
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// File name check for the working directory.
///
/// On top of `validate_file_name`, names ffmpeg would open as a protocol URL
/// (`pipe:0`, `concat:a|b`) instead of a file are rejected.
fn validate_local_name(name: &str) -> EngineResult<()> {
    validate_file_name(name)?;
    if name.contains(':') {
        return Err(EngineError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Check whether an ffmpeg binary at `path` can be executed
pub fn is_core_available(path: &Path) -> bool {
    std::process::Command::new(path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;

    fn engine_at(core_path: &str) -> ProcessEngine {
        ProcessEngine::new(EngineOptions {
            log: false,
            core_path: PathBuf::from(core_path),
            sinks: EngineSinks::discard(),
        })
    }

    #[tokio::test]
    async fn test_missing_core_fails_load() {
        let engine = engine_at("/nonexistent/intogif/ffmpeg");

        let result = engine.load().await;
        assert!(matches!(result, Err(EngineError::CoreUnavailable { .. })));
        assert!(!engine.is_loaded());
    }

    #[tokio::test]
    async fn test_filesystem_requires_load() {
        let engine = engine_at("ffmpeg");

        assert!(matches!(
            engine.write_file("input.mov", Bytes::new()).await,
            Err(EngineError::NotLoaded)
        ));
        assert!(matches!(
            engine.run(&["-version".to_string()]).await,
            Err(EngineError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_protocol_like_names_are_rejected() {
        let engine = engine_at("ffmpeg");

        for name in ["pipe:0", "concat:a.mov|b.mov", "http:clip"] {
            assert!(matches!(
                engine.write_file(name, Bytes::from_static(b"x")).await,
                Err(EngineError::InvalidName { .. })
            ));
        }
        assert!(matches!(
            engine.remove_file("pipe:1").await,
            Err(EngineError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn test_output_forwarding_splits_carriage_returns() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let ratios = Arc::new(Mutex::new(Vec::new()));
        let sinks = {
            let lines = Arc::clone(&lines);
            let ratios = Arc::clone(&ratios);
            EngineSinks::new(
                move |line| lines.lock().push(line.message),
                move |sample| ratios.lock().push(sample.ratio),
            )
        };

        let output: &[u8] = b"  Duration: 00:00:04.00, start: 0.000000\n\
            frame=   10 time=00:00:01.00 bitrate=N/A\r\
            frame=   20 time=00:00:02.00 bitrate=N/A\r\n\
            video:120kB audio:0kB";
        forward_engine_output(output, sinks, false).await;

        assert_eq!(lines.lock().len(), 4);
        assert_eq!(*ratios.lock(), vec![0.25, 0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_round_trip_with_real_ffmpeg() {
        if !is_core_available(Path::new("ffmpeg")) {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }

        let engine = engine_at("ffmpeg");
        assert_ok!(engine.load().await);
        assert_ok!(
            engine
                .write_file("note.txt", Bytes::from_static(b"hello"))
                .await
        );
        assert_eq!(
            engine.read_file("note.txt").await.unwrap(),
            Bytes::from_static(b"hello")
        );
        assert!(matches!(
            engine.read_file("absent.gif").await,
            Err(EngineError::FileNotFound { .. })
        ));
        assert_ok!(engine.remove_file("note.txt").await);
        assert_ok!(engine.remove_file("note.txt").await);
        assert!(matches!(
            engine.read_file("note.txt").await,
            Err(EngineError::FileNotFound { .. })
        ));

        let workdir = engine.workdir().unwrap();
        engine.exit();
        assert!(!engine.is_loaded());
        assert!(!workdir.exists());
    }
}
