//! Tier-based storage engine.
//!
//! Continuous segments and event recordings age through an ordered list of
//! storage tiers with size and age budgets. The scanning and file operations
//! run in a dedicated worker subprocess with lowered CPU priority; the main
//! process talks to it over JSON lines on stdin/stdout and routes results to
//! callbacks.

pub mod check;
pub mod indexer;
pub mod ops;
pub mod proto;
pub mod scheduler;
pub mod subprocess;
pub mod supervisor;
pub mod worker;

/// Length in seconds of one continuous segment written by the camera's
/// segmenter.
pub const SEGMENT_DURATION: i64 = argus_types::SEGMENT_DURATION_SECS;
