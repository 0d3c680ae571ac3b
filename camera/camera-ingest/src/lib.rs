//! Camera ingestion: probing, decoder subprocess supervision, and the
//! reader/relay threads that turn the raw pipe into shared frames on the
//! bus.

pub mod camera;
pub mod command;
pub mod probe;
pub mod stream;

pub use camera::{setup_camera, IngestCamera};

/// Consecutive empty reads before the decoder is declared broken.
pub const MAX_EMPTY_FRAMES: u32 = 10;

/// Pause before restarting a broken decoder pipe.
pub const RESTART_PAUSE_SECS: u64 = 5;

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("ffprobe timed out after {timeout:?} (command: {command})")]
    FfprobeTimeout {
        command: String,
        timeout: std::time::Duration,
    },
    #[error("ffprobe reported an error: {0}")]
    FfprobeError(String),
    #[error("could not parse ffprobe output: {0}")]
    FfprobeOutput(String),
    #[error("stream information missing: width={width:?} height={height:?} fps={fps:?}")]
    StreamInformation {
        width: Option<u32>,
        height: Option<u32>,
        fps: Option<f32>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
