//! Video-to-GIF conversion
//!
//! A conversion stages the submitted video under a normalized name, runs the
//! fixed palette-optimized transcode and reads back `output.gif`.

pub mod filename;
pub mod job;

pub use filename::{STAGED_BASE_NAME, normalize};
pub use job::{
    ConversionError, ConversionJob, FILTER_GRAPH, FailureKind, Generation, InputFile, JobState,
    OUTPUT_NAME, transcode_args,
};
