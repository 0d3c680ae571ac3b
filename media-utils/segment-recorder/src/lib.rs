//! Event recording by segment concatenation.
//!
//! The camera's segmenter continuously writes short segments; this crate
//! turns an event window into a single clip by concatenating the segments
//! between a lookback-adjusted start and the event end, and keeps the
//! segment directory pruned in between.

pub mod cleanup;
pub mod recorder;
pub mod segments;

pub use argus_types::SEGMENT_DURATION_SECS;
pub use recorder::{Recorder, RecorderSettings};

#[derive(thiserror::Error, Debug)]
pub enum ConcatError {
    #[error("no segments available in {0}")]
    NoSegments(std::path::PathBuf),
    #[error("concat process failed: {0}")]
    ProcessFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
