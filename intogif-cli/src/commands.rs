//! CLI command implementations

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use intogif_core::config::IntogifConfig;
use intogif_core::conversion::{FailureKind, InputFile, normalize, transcode_args};
use intogif_core::engine::process::is_core_available;
use intogif_core::session::{
    SessionController, SessionError, SessionFailure, SessionSnapshot, SessionState,
    TracingLogSink,
};
use intogif_core::IntogifError;
use serde::Serialize;
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Convert a video into an animated GIF
    Convert {
        /// Video file to convert
        input: PathBuf,
        /// Where to write the GIF (defaults to the input path with a .gif extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Path to the ffmpeg binary
        #[arg(long)]
        ffmpeg: Option<PathBuf>,
        /// Use the in-memory engine instead of ffmpeg
        #[arg(long)]
        simulate: bool,
        /// Do not mirror engine output into the logs
        #[arg(long)]
        quiet_engine: bool,
        /// Print a JSON report to stdout
        #[arg(long)]
        json: bool,
    },
    /// Show how a file would be staged and transcoded without running anything
    Plan {
        /// File name of the video
        name: String,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Convert {
            input,
            output,
            ffmpeg,
            simulate,
            quiet_engine,
            json,
        } => {
            let mut config = IntogifConfig::from_env();
            if let Some(path) = ffmpeg {
                config.engine.core_path = path;
            }
            if simulate {
                config.simulation.enabled = true;
            }
            if quiet_engine {
                config.engine.log = false;
            }
            let output = output.unwrap_or_else(|| default_output_path(&input));
            convert(&config, &input, &output, json).await
        }
        Commands::Plan { name, json } => show_plan(&name, json),
    }
}

/// Machine-readable outcome of `convert`
#[derive(Debug, Serialize)]
struct ConversionReport {
    input: String,
    state: SessionState,
    job: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<OutputReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureReport>,
}

#[derive(Debug, Serialize)]
struct OutputReport {
    path: String,
    resource: String,
    mime_type: &'static str,
    bytes: usize,
}

#[derive(Debug, Serialize)]
struct FailureReport {
    kind: Option<FailureKind>,
    message: String,
    detail: String,
    diagnostics: Vec<String>,
}

impl FailureReport {
    fn from_failure(failure: &SessionFailure) -> Self {
        let diagnostics = match failure {
            SessionFailure::Conversion(error) => error.diagnostics().to_vec(),
            SessionFailure::EngineInit(_) => Vec::new(),
        };
        Self {
            kind: failure.kind(),
            message: failure.user_message().to_string(),
            detail: failure.to_string(),
            diagnostics,
        }
    }
}

/// Convert one video file
///
/// # Errors
/// - `IntogifError::Configuration` - Input path is not a readable file
/// - `IntogifError::Session` - Session rejected the file or ended without a result
/// - `IntogifError::Failed` - Engine failed to load or the conversion failed
/// - `IntogifError::Io` - GIF could not be written
pub async fn convert(
    config: &IntogifConfig,
    input: &Path,
    output: &Path,
    json: bool,
) -> anyhow::Result<()> {
    if !input.is_file() {
        return Err(IntogifError::Configuration {
            reason: format!("{} is not a file", input.display()),
        }
        .into());
    }
    if !config.simulation.enabled && !is_core_available(&config.engine.core_path) {
        warn!(
            "ffmpeg not found at {}, loading will fail",
            config.engine.core_path.display()
        );
    }

    let file = InputFile::from_path(input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    info!(
        "Converting {} ({} bytes) to {}",
        input.display(),
        file.len(),
        output.display()
    );

    let snapshot = run_session(config, file, !json).await?;

    let mut report = ConversionReport {
        input: input.display().to_string(),
        state: snapshot.state,
        job: snapshot.generation.0,
        output: None,
        failure: None,
    };

    match (snapshot.output, snapshot.failure) {
        (Some(gif), _) => {
            gif.write_to(output)
                .await
                .map_err(IntogifError::Io)
                .with_context(|| format!("failed to write {}", output.display()))?;
            report.output = Some(OutputReport {
                path: output.display().to_string(),
                resource: gif.resource_uri(),
                mime_type: gif.mime_type(),
                bytes: gif.len(),
            });
            if json {
                print_json(&report)?;
            } else {
                println!("Wrote {} ({} bytes)", output.display(), gif.len());
            }
            Ok(())
        }
        (None, Some(failure)) => {
            report.failure = Some(FailureReport::from_failure(&failure));
            let error = IntogifError::from(failure);
            if json {
                print_json(&report)?;
            } else {
                eprintln!("{}", error.user_message());
            }
            Err(error.into())
        }
        (None, None) => {
            warn!("Session ended in state {} without a result", snapshot.state);
            Err(IntogifError::Session(SessionError::Stopped).into())
        }
    }
}

/// Run one conversion session for `file` and return its settled snapshot
///
/// # Errors
/// - `IntogifError::Session` - Session refused to start or to take the file
async fn run_session(
    config: &IntogifConfig,
    file: InputFile,
    show_progress: bool,
) -> intogif_core::Result<SessionSnapshot> {
    let session = SessionController::from_config(config, Arc::new(TracingLogSink));
    session.start()?;
    session.submit(Some(file))?;

    let snapshot = wait_with_progress(&session, show_progress).await;
    session.stop();
    Ok(snapshot)
}

/// Wait for the session to settle, drawing a progress line on stderr
async fn wait_with_progress(session: &SessionController, show_progress: bool) -> SessionSnapshot {
    let mut updates = session.subscribe();
    let mut drawn = false;

    let snapshot = loop {
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.state.is_settled() {
            break snapshot;
        }
        if show_progress && let Some(ratio) = snapshot.progress {
            eprint!("\rConverting... {:>5.1}%", ratio * 100.0);
            let _ = std::io::stderr().flush();
            drawn = true;
        }
        if updates.changed().await.is_err() {
            break session.snapshot();
        }
    };

    if drawn {
        eprintln!();
    }
    snapshot
}

/// Print the staged name and engine arguments for `name`
///
/// # Errors
/// - `serde_json::Error` - Plan could not be serialized
pub fn show_plan(name: &str, json: bool) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct Plan {
        staged_name: String,
        args: Vec<String>,
    }

    let staged_name = normalize(name);
    let plan = Plan {
        args: transcode_args(&staged_name),
        staged_name,
    };

    if json {
        print_json(&plan)?;
    } else {
        println!("Staged as: {}", plan.staged_name);
        println!("Engine arguments:");
        for arg in &plan.args {
            println!("  {arg}");
        }
    }
    Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `clip.mov` -> `clip.gif`; a `.gif` input gets `.converted.gif`
fn default_output_path(input: &Path) -> PathBuf {
    let is_gif = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gif"));
    if is_gif {
        input.with_extension("converted.gif")
    } else {
        input.with_extension("gif")
    }
}
