//! Per-camera processing pipeline.
//!
//! The pipeline pulls shared frames off the bus, feeds them to the camera's
//! motion and object scanners at their configured rates, interprets the
//! results and drives the recorder. Scanner runtimes live here too; concrete
//! detector algorithms plug in through the [`scanners::MotionDetect`] and
//! [`scanners::ObjectDetect`] traits.

pub mod interval;
pub mod pipeline;
pub mod scanners;

pub use pipeline::{setup_nvr, NvrHandle};

/// Frames older than this many seconds are discarded by the pipeline.
pub const MAX_PIPELINE_FRAME_AGE: f64 = 1.0;

/// How long the pipeline waits for one scanner result.
pub const SCANNER_RESULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);
