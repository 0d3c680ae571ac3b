//! Periodic pruning of continuous segments.
//!
//! Segments older than `lookback + 3 × segment_duration` are deleted every
//! segment interval, so the recorder always has its lookback window on disk.
//! The recorder pauses the scheduler while an event is open or a concat job
//! is running.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::segments::parse_segment_stem;
use crate::SEGMENT_DURATION_SECS;

/// Delete every segment in `directory` whose start time is more than
/// `max_age_secs` before `now`.
pub fn cleanup_pass(directory: &Path, max_age_secs: i64, now: i64) {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            error!("could not list segments in {}: {e}", directory.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(start) = parse_segment_stem(&file_name) else {
            error!("could not extract timestamp from segment {file_name}");
            continue;
        };
        if now - start > max_age_secs {
            debug!("removing expired segment {file_name}");
            if let Err(e) = std::fs::remove_file(entry.path()) {
                error!("could not remove segment {file_name}: {e}");
            }
        }
    }
}

pub struct SegmentCleanup {
    paused: Arc<AtomicBool>,
    stop: Sender<()>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SegmentCleanup {
    /// `max_age_secs` must be at least `lookback + 3 × segment_duration` so
    /// a recording's lookback window is never pruned from under it.
    pub fn spawn(directory: PathBuf, max_age_secs: i64) -> Self {
        let paused = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_paused = paused.clone();
        let handle = std::thread::Builder::new()
            .name("segment-cleanup".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(Duration::from_secs(SEGMENT_DURATION_SECS as u64)) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                }
                if thread_paused.load(Ordering::SeqCst) {
                    continue;
                }
                cleanup_pass(&directory, max_age_secs, chrono::Utc::now().timestamp());
            })
            .expect("spawn segment cleanup");
        SegmentCleanup {
            paused,
            stop: stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn pause(&self) {
        debug!("pausing segment cleanup");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        debug!("resuming segment cleanup");
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
