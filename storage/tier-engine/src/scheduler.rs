//! Periodic tier checks and application of their results.
//!
//! For every camera and tier, a `check_tier` command is enqueued each
//! interval. Selected files move to the next tier (updating their database
//! row) or, at the last tier, are deleted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use argus_db::Database;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::indexer::{self, CATEGORY_RECORDER, SUBCATEGORY_SEGMENTS};
use crate::proto::{BudgetParams, Response};
use crate::supervisor::StorageWorker;

#[derive(Debug, Clone)]
pub struct TierSpec {
    pub tier_id: i64,
    pub path: PathBuf,
    pub continuous: Option<BudgetParams>,
    pub events: Option<BudgetParams>,
    pub throttle_period_secs: i64,
}

/// Rebase `path` from its current tier directory onto `new_tier`.
pub fn retarget_path(path: &str, old_tier: &str, new_tier: &Path) -> PathBuf {
    match Path::new(path).strip_prefix(old_tier) {
        Ok(relative) => new_tier.join(relative),
        Err(_) => {
            // Path no longer under its recorded tier; fall back to the bare
            // file name so the move still lands inside the new tier.
            let name = Path::new(path).file_name().unwrap_or_default();
            new_tier.join(name)
        }
    }
}

pub struct TierScheduler {
    stop: Sender<()>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TierScheduler {
    /// `segment_dirs` maps each camera to its live segment directory; new
    /// segments found there are indexed into the first tier every pass.
    pub fn spawn(
        worker: Arc<StorageWorker>,
        db: Arc<Database>,
        cameras: Vec<String>,
        segment_dirs: HashMap<String, PathBuf>,
        tiers: Vec<TierSpec>,
        check_interval: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("tier-scheduler".into())
            .spawn(move || {
                info!(
                    "tier scheduler running for {} cameras over {} tiers",
                    cameras.len(),
                    tiers.len()
                );
                let mut known: HashMap<String, HashSet<String>> = HashMap::new();
                loop {
                    if let Some(first_tier) = tiers.first() {
                        for camera in &cameras {
                            if let Some(directory) = segment_dirs.get(camera) {
                                indexer::index_segments(
                                    &db,
                                    camera,
                                    first_tier.tier_id,
                                    &first_tier.path.display().to_string(),
                                    directory,
                                    known.entry(camera.clone()).or_default(),
                                );
                            }
                        }
                    }
                    run_pass(&worker, &db, &cameras, &tiers);
                    match stop_rx.recv_timeout(check_interval) {
                        Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    }
                }
            })
            .expect("spawn tier scheduler");
        TierScheduler {
            stop: stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_pass(
    worker: &Arc<StorageWorker>,
    db: &Arc<Database>,
    cameras: &[String],
    tiers: &[TierSpec],
) {
    for camera in cameras {
        for (idx, tier) in tiers.iter().enumerate() {
            let next_tier = tiers.get(idx + 1).cloned();
            let worker2 = worker.clone();
            let db2 = db.clone();
            let camera2 = camera.clone();
            worker.check_tier(
                camera,
                tier.tier_id,
                CATEGORY_RECORDER,
                vec![SUBCATEGORY_SEGMENTS.to_string()],
                tier.throttle_period_secs,
                tier.continuous.clone(),
                tier.events.clone(),
                Box::new(move |response: Response| {
                    if let Some(error) = response.error {
                        error!("tier check for {camera2} failed: {error}");
                        return;
                    }
                    apply_candidates(&worker2, &db2, next_tier.as_ref(), response);
                }),
            );
        }
    }
}

fn apply_candidates(
    worker: &Arc<StorageWorker>,
    db: &Arc<Database>,
    next_tier: Option<&TierSpec>,
    response: Response,
) {
    for candidate in response.files_to_move {
        match next_tier {
            Some(next) => {
                let dst = retarget_path(&candidate.path, &candidate.tier_path, &next.path);
                let dst_str = dst.display().to_string();
                let db = db.clone();
                let src = candidate.path.clone();
                let next_tier_id = next.tier_id;
                let next_tier_path = next.path.display().to_string();
                debug!("moving {src} to {dst_str}");
                worker.move_file(
                    &candidate.path,
                    &dst_str.clone(),
                    Box::new(move |response: Response| match response.error {
                        None => {
                            if let Err(e) =
                                db.update_file_tier(&src, next_tier_id, &next_tier_path, &dst_str)
                            {
                                error!("could not retier file row {src}: {e}");
                            }
                        }
                        Some(error) => error!("move of {src} failed: {error}"),
                    }),
                );
            }
            None => {
                let src = candidate.path.clone();
                debug!("deleting {src} at final tier");
                worker.delete_file(
                    &candidate.path,
                    Box::new(move |response: Response| {
                        if let Some(error) = response.error {
                            error!("delete of {src} failed: {error}");
                        }
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_keeps_relative_layout() {
        let dst = retarget_path("/tier1/cam_1/a.m4s", "/tier1", Path::new("/tier2"));
        assert_eq!(dst, PathBuf::from("/tier2/cam_1/a.m4s"));
    }

    #[test]
    fn retarget_falls_back_to_file_name() {
        let dst = retarget_path("/elsewhere/a.m4s", "/tier1", Path::new("/tier2"));
        assert_eq!(dst, PathBuf::from("/tier2/a.m4s"));
    }
}
