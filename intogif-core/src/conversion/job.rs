//! Single video-to-GIF conversion run against a ready engine

use std::fmt;
use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::filename::normalize;
use crate::engine::{EngineError, EngineHandle};

/// Name the engine writes the animated image to
pub const OUTPUT_NAME: &str = "output.gif";

/// Filter graph producing the animated image.
///
/// 10 fps, scaled to 640 px wide keeping aspect ratio, split into a path that
/// builds an optimized palette and a path that is mapped onto that palette
/// with Floyd-Steinberg dithering.
pub const FILTER_GRAPH: &str = "[0:v] fps=10,scale=640:-1,split [a][b];[a] palettegen [p];[b][p] paletteuse=dither=floyd_steinberg";

/// Engine arguments transcoding `staged_name` into [`OUTPUT_NAME`]
pub fn transcode_args(staged_name: &str) -> Vec<String> {
    vec![
        "-i".to_string(),
        staged_name.to_string(),
        "-filter_complex".to_string(),
        FILTER_GRAPH.to_string(),
        OUTPUT_NAME.to_string(),
    ]
}

/// Identifier of one submitted job.
///
/// Assigned in increasing order by the session; only the latest generation's
/// result is ever applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Video file submitted for conversion.
#[derive(Debug, Clone)]
pub struct InputFile {
    display_name: String,
    bytes: Bytes,
}

impl InputFile {
    /// Create an input from a display name and its contents.
    ///
    /// Directory components in `display_name` are dropped; only the final
    /// component names the file.
    pub fn new(display_name: impl AsRef<str>, bytes: impl Into<Bytes>) -> Self {
        let display_name = display_name.as_ref();
        let base = display_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(display_name);
        Self {
            display_name: base.to_string(),
            bytes: bytes.into(),
        }
    }

    /// Read an input file from disk.
    ///
    /// # Errors
    /// - `std::io::Error` - File could not be read
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, bytes))
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
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
}

/// Step at which a conversion failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Staging,
    Transcode,
    Retrieval,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Staging => "staging",
            FailureKind::Transcode => "transcode",
            FailureKind::Retrieval => "retrieval",
        };
        f.write_str(name)
    }
}

/// Classified conversion failure
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Failed to stage {staged_name} into the engine: {source}")]
    Staging {
        staged_name: String,
        #[source]
        source: EngineError,
    },

    #[error("Transcode of {staged_name} failed: {source}")]
    Transcode {
        staged_name: String,
        /// Engine log lines emitted while this job ran
        diagnostics: Vec<String>,
        #[source]
        source: EngineError,
    },

    #[error("Failed to retrieve {output_name} from the engine: {source}")]
    Retrieval {
        output_name: String,
        #[source]
        source: EngineError,
    },
}

impl ConversionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConversionError::Staging { .. } => FailureKind::Staging,
            ConversionError::Transcode { .. } => FailureKind::Transcode,
            ConversionError::Retrieval { .. } => FailureKind::Retrieval,
        }
    }

    /// Engine output captured for a failed transcode
    pub fn diagnostics(&self) -> &[String] {
        match self {
            ConversionError::Transcode { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }

    pub fn engine_error(&self) -> &EngineError {
        match self {
            ConversionError::Staging { source, .. }
            | ConversionError::Transcode { source, .. }
            | ConversionError::Retrieval { source, .. } => source,
        }
    }
}

/// Progress of a conversion job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Not started
    Pending,
    /// Input written to the engine filesystem
    Staged,
    /// Engine command running
    Transcoding,
    /// Output retrieved
    Succeeded,
    /// Failed at the given step
    Failed(FailureKind),
}

/// Drives stage -> transcode -> retrieve for one input file.
///
/// Progress and log output are not collected here; they reach the caller
/// through the sinks registered when the engine handle was created.
#[derive(Debug)]
pub struct ConversionJob {
    generation: Generation,
    input: Option<InputFile>,
    display_name: String,
    staged_name: String,
    state: JobState,
}

impl ConversionJob {
    pub fn new(generation: Generation, input: InputFile) -> Self {
        let staged_name = normalize(input.display_name());
        Self {
            generation,
            display_name: input.display_name().to_string(),
            input: Some(input),
            staged_name,
            state: JobState::Pending,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn staged_name(&self) -> &str {
        &self.staged_name
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Run the conversion.
    ///
    /// The caller holds the engine lease for the whole call. A job runs at
    /// most once; the input is released as soon as it has been staged. Any
    /// `output.gif` left in the engine filesystem is removed before staging,
    /// and the staged input and output are removed once the job ends.
    ///
    /// # Errors
    /// - `ConversionError::Staging` - Input could not be written (including an unloaded engine)
    /// - `ConversionError::Transcode` - Engine command failed
    /// - `ConversionError::Retrieval` - Output missing or empty
    pub async fn run(&mut self, engine: &EngineHandle) -> Result<Bytes, ConversionError> {
        let started = Instant::now();

        info!(
            job = %self.generation,
            input = %self.display_name,
            staged = %self.staged_name,
            "Starting conversion"
        );

        let Some(input) = self.input.take() else {
            return self.fail(ConversionError::Staging {
                staged_name: self.staged_name.clone(),
                source: EngineError::RunFailed {
                    reason: "job already ran".to_string(),
                },
            });
        };
        let input_len = input.len();

        let result = self.convert(engine, input).await;
        self.clear_engine_files(engine).await;

        match result {
            Ok(output) => {
                self.transition(JobState::Succeeded);
                info!(
                    job = %self.generation,
                    input_bytes = input_len,
                    output_bytes = output.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Conversion finished"
                );
                Ok(output)
            }
            Err(error) => self.fail(error),
        }
    }

    async fn convert(
        &mut self,
        engine: &EngineHandle,
        input: InputFile,
    ) -> Result<Bytes, ConversionError> {
        let log_mark = engine.log_mark();
        let staging_failed = |source: EngineError| ConversionError::Staging {
            staged_name: self.staged_name.clone(),
            source,
        };

        // An output left behind by an earlier job must not pass for this one's
        engine
            .engine()
            .remove_file(OUTPUT_NAME)
            .await
            .map_err(staging_failed)?;
        engine
            .engine()
            .write_file(&self.staged_name, input.bytes)
            .await
            .map_err(staging_failed)?;
        self.transition(JobState::Staged);

        let args = transcode_args(&self.staged_name);
        self.transition(JobState::Transcoding);
        if let Err(source) = engine.engine().run(&args).await {
            return Err(ConversionError::Transcode {
                staged_name: self.staged_name.clone(),
                diagnostics: engine.log_since(log_mark),
                source,
            });
        }

        match engine.engine().read_file(OUTPUT_NAME).await {
            Ok(output) if output.is_empty() => Err(EngineError::EmptyFile {
                name: OUTPUT_NAME.to_string(),
            }),
            other => other,
        }
        .map_err(|source| ConversionError::Retrieval {
            output_name: OUTPUT_NAME.to_string(),
            source,
        })
    }

    /// Remove this job's files from the engine filesystem
    async fn clear_engine_files(&self, engine: &EngineHandle) {
        for name in [self.staged_name.as_str(), OUTPUT_NAME] {
            if let Err(e) = engine.engine().remove_file(name).await {
                debug!(job = %self.generation, "Could not remove {:?}: {}", name, e);
            }
        }
    }

    fn transition(&mut self, next: JobState) {
        debug!(job = %self.generation, from = ?self.state, to = ?next, "Job state changed");
        self.state = next;
    }

    fn fail(&mut self, error: ConversionError) -> Result<Bytes, ConversionError> {
        self.transition(JobState::Failed(error.kind()));
        warn!(job = %self.generation, kind = %error.kind(), "Conversion failed: {}", error);
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{
        EngineSinks, RunOutcome, SimulatedEngineFactory, SimulationProbe, SimulationScript,
    };

    async fn ready_engine(script: SimulationScript) -> (EngineHandle, SimulationProbe) {
        let factory = SimulatedEngineFactory::new(script);
        let probe = factory.probe();
        let handle =
            EngineHandle::create(&factory, &EngineConfig::default(), EngineSinks::discard());
        assert_ok!(handle.load().await);
        (handle, probe)
    }

    fn clip() -> InputFile {
        InputFile::new("clip.mov", Bytes::from_static(b"moov-data"))
    }

    #[test]
    fn test_transcode_args_are_fixed() {
        assert_eq!(
            transcode_args("input.mov"),
            vec![
                "-i",
                "input.mov",
                "-filter_complex",
                "[0:v] fps=10,scale=640:-1,split [a][b];[a] palettegen [p];[b][p] paletteuse=dither=floyd_steinberg",
                "output.gif",
            ]
        );
    }

    #[test]
    fn test_input_file_drops_directories() {
        assert_eq!(InputFile::new("/home/me/clip.mov", Bytes::new()).display_name(), "clip.mov");
        assert_eq!(InputFile::new("C:\\videos\\a.mp4", Bytes::new()).display_name(), "a.mp4");
        assert_eq!(InputFile::new("noext", Bytes::new()).display_name(), "noext");
    }

    #[tokio::test]
    async fn test_successful_conversion() {
        let (engine, probe) = ready_engine(SimulationScript::new()).await;
        let mut job = ConversionJob::new(Generation(1), clip());
        assert_eq!(job.staged_name(), "input.mov");

        let output = job.run(&engine).await.unwrap();
        assert!(output.starts_with(b"GIF89a"));
        assert_eq!(job.state(), &JobState::Succeeded);
        assert_eq!(probe.writes(), vec!["input.mov".to_string()]);
        assert_eq!(probe.runs(), vec![transcode_args("input.mov")]);
        assert_eq!(probe.reads(), vec![OUTPUT_NAME.to_string()]);
        assert_eq!(
            probe.removals(),
            vec![
                OUTPUT_NAME.to_string(),
                "input.mov".to_string(),
                OUTPUT_NAME.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_earlier_output_is_not_returned_again() {
        let script = SimulationScript::new()
            .with_run_outcomes(vec![RunOutcome::Succeed, RunOutcome::OmitOutput]);
        let (engine, _probe) = ready_engine(script).await;

        let mut first = ConversionJob::new(Generation(1), clip());
        assert_ok!(first.run(&engine).await);

        // Left over from outside the job lifecycle, e.g. an aborted run
        assert_ok!(
            engine
                .engine()
                .write_file(OUTPUT_NAME, Bytes::from_static(b"GIF89aSTALE"))
                .await
        );

        let mut second = ConversionJob::new(
            Generation(2),
            InputFile::new("two.mov", Bytes::from_static(b"TWO")),
        );
        let error = second.run(&engine).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Retrieval);
        assert!(matches!(
            error.engine_error(),
            EngineError::FileNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_staging_failure_is_classified() {
        let (engine, probe) =
            ready_engine(SimulationScript::new().with_stage_failure("quota exceeded")).await;
        let mut job = ConversionJob::new(Generation(1), clip());

        let error = job.run(&engine).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Staging);
        assert_eq!(job.state(), &JobState::Failed(FailureKind::Staging));
        assert!(probe.runs().is_empty());
    }

    #[tokio::test]
    async fn test_empty_staged_name_fails_staging() {
        let (engine, _probe) = ready_engine(SimulationScript::new()).await;
        let mut job = ConversionJob::new(Generation(1), InputFile::new("", Bytes::new()));

        let error = job.run(&engine).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Staging);
        assert!(matches!(
            error.engine_error(),
            EngineError::InvalidName { .. }
        ));
    }

    #[tokio::test]
    async fn test_transcode_failure_carries_diagnostics() {
        let script = SimulationScript::new()
            .with_log_lines(vec![
                "[mov,mp4,m4a,3gp,3g2,mj2 @ 0x5581] moov atom not found".to_string(),
            ])
            .with_run_outcomes(vec![RunOutcome::Fail(
                "input.mov: Invalid data found when processing input".to_string(),
            )]);
        let (engine, probe) = ready_engine(script).await;
        let mut job = ConversionJob::new(Generation(1), clip());

        let error = job.run(&engine).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Transcode);
        assert!(
            error
                .diagnostics()
                .iter()
                .any(|line| line.contains("Invalid data found"))
        );
        assert!(
            error
                .diagnostics()
                .iter()
                .any(|line| line.contains("moov atom not found"))
        );
        // Diagnostics only cover this job, not the engine load
        assert!(
            !error
                .diagnostics()
                .iter()
                .any(|line| line.contains("load ffmpeg-core"))
        );
        assert!(probe.reads().is_empty());
    }

    #[tokio::test]
    async fn test_missing_output_is_retrieval_failure() {
        let script = SimulationScript::new().with_run_outcomes(vec![RunOutcome::OmitOutput]);
        let (engine, _probe) = ready_engine(script).await;
        let mut job = ConversionJob::new(Generation(1), clip());

        let error = job.run(&engine).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Retrieval);
        assert!(matches!(
            error.engine_error(),
            EngineError::FileNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_unloaded_engine_fails_staging() {
        let factory = SimulatedEngineFactory::new(SimulationScript::new());
        let engine =
            EngineHandle::create(&factory, &EngineConfig::default(), EngineSinks::discard());
        let mut job = ConversionJob::new(Generation(1), clip());

        let error = job.run(&engine).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Staging);
        assert!(matches!(error.engine_error(), EngineError::NotLoaded));
    }

    #[tokio::test]
    async fn test_job_runs_once() {
        let (engine, probe) = ready_engine(SimulationScript::new()).await;
        let mut job = ConversionJob::new(Generation(1), clip());

        assert_ok!(job.run(&engine).await);
        assert!(job.run(&engine).await.is_err());
        assert_eq!(probe.writes().len(), 1);
    }
}
