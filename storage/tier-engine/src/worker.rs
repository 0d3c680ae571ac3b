//! Command execution inside the worker subprocess.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use argus_db::Database;
use parking_lot::Mutex;
use tracing::debug;

use crate::check;
use crate::ops;
use crate::proto::{BudgetParams, CheckTierCommand, Command, MoveCandidate, Response};
use crate::SEGMENT_DURATION;

struct ThrottleState {
    last_call: HashMap<String, i64>,
    in_progress: HashSet<String>,
}

pub struct TierWorker {
    db: Arc<Database>,
    state: Mutex<ThrottleState>,
}

impl TierWorker {
    pub fn new(db: Arc<Database>) -> Self {
        TierWorker {
            db,
            state: Mutex::new(ThrottleState {
                last_call: HashMap::new(),
                in_progress: HashSet::new(),
            }),
        }
    }

    /// Execute one command; any error is captured into the response.
    pub fn handle(&self, command: &Command, now: i64) -> Response {
        let id = command.id();
        let result = match command {
            Command::CheckTier(cmd) => self.check_tier(cmd, now),
            Command::MoveFile { src, dst, .. } => {
                ops::move_file(&self.db, Path::new(src), Path::new(dst))
                    .map(|()| Vec::new())
                    .map_err(|e| e.to_string())
            }
            Command::DeleteFile { src, .. } => ops::delete_file(&self.db, Path::new(src))
                .map(|()| Vec::new())
                .map_err(|e| e.to_string()),
        };
        match result {
            Ok(files_to_move) => Response {
                id,
                files_to_move,
                error: None,
            },
            Err(error) => Response {
                id,
                files_to_move: Vec::new(),
                error: Some(error),
            },
        }
    }

    /// Tier check with per-camera serialisation and last-call throttling.
    /// Overlapping or throttled calls return an empty result immediately.
    fn check_tier(
        &self,
        cmd: &CheckTierCommand,
        now: i64,
    ) -> Result<Vec<MoveCandidate>, String> {
        let throttle_key = cmd.throttle_key();
        {
            let mut state = self.state.lock();
            if state.in_progress.contains(&cmd.camera_identifier) {
                return Ok(Vec::new());
            }
            let last = state.last_call.get(&throttle_key).copied().unwrap_or(0);
            if cmd.throttle_period_secs > 0 && now - last < cmd.throttle_period_secs {
                return Ok(Vec::new());
            }
            state.in_progress.insert(cmd.camera_identifier.clone());
        }

        let result = self.run_check(cmd, now);

        let mut state = self.state.lock();
        state.last_call.insert(throttle_key, now);
        state.in_progress.remove(&cmd.camera_identifier);
        result
    }

    fn run_check(&self, cmd: &CheckTierCommand, now: i64) -> Result<Vec<MoveCandidate>, String> {
        let files = self
            .db
            .files_for_tier(
                &cmd.camera_identifier,
                cmd.tier_id,
                &cmd.category,
                &cmd.subcategories,
            )
            .map_err(|e| e.to_string())?;
        debug!(
            "loaded {} files for {} tier {} category {}",
            files.len(),
            cmd.camera_identifier,
            cmd.tier_id,
            cmd.category
        );

        let file_candidates = cmd.files.as_ref().map(|budget| {
            let (min_age_ts, max_age_ts) = age_cutoffs(budget, now, 2);
            check::files_to_move(
                files.clone(),
                budget.max_bytes,
                min_age_ts,
                budget.min_bytes,
                max_age_ts,
            )
            .into_iter()
            .map(|f| MoveCandidate {
                recording_id: None,
                file_id: f.id,
                path: f.path,
                tier_path: f.tier_path,
            })
            .collect::<Vec<_>>()
        });

        let event_candidates = match cmd.events.as_ref() {
            Some(budget) => {
                let recordings = self
                    .db
                    .recordings_for_camera(&cmd.camera_identifier, now)
                    .map_err(|e| e.to_string())?;
                debug!(
                    "loaded {} recordings for {}",
                    recordings.len(),
                    cmd.camera_identifier
                );
                let (min_age_ts, max_age_ts) = age_cutoffs(budget, now, 2);
                // Segments younger than five segment lengths may still be
                // referenced by live HLS playback.
                let file_min_age_ts = now - SEGMENT_DURATION * 5;
                Some(check::recordings_to_move(
                    recordings,
                    files,
                    SEGMENT_DURATION,
                    budget.max_bytes,
                    min_age_ts,
                    budget.min_bytes,
                    max_age_ts,
                    file_min_age_ts,
                ))
            }
            None => None,
        };

        let selected = match (file_candidates, event_candidates) {
            (Some(files), Some(events)) => {
                let file_ids: HashSet<i64> = files.iter().map(|c| c.file_id).collect();
                events
                    .into_iter()
                    .filter(|c| file_ids.contains(&c.file_id))
                    .collect()
            }
            (Some(files), None) => files,
            (None, Some(events)) => events,
            (None, None) => Vec::new(),
        };
        debug!(
            "found {} files to move for {} tier {} category {}",
            selected.len(),
            cmd.camera_identifier,
            cmd.tier_id,
            cmd.category
        );
        Ok(selected)
    }
}

/// Absolute (min_age, max_age) cutoffs for a budget. An unset `min_age`
/// falls back to `floor_segments` segment lengths so files still being
/// written are never touched; an unset `max_age` disables the age rule.
fn age_cutoffs(budget: &BudgetParams, now: i64, floor_segments: i64) -> (i64, i64) {
    let min_age_ts = match budget.min_age_secs {
        Some(secs) if secs > 0 => now - secs,
        _ => now - SEGMENT_DURATION * floor_segments,
    };
    let max_age_ts = match budget.max_age_secs {
        Some(secs) if secs > 0 => now - secs,
        _ => 0,
    };
    (min_age_ts, max_age_ts)
}
