//! Pure tier-budget selection.
//!
//! Rows are sorted newest-first and cumulative sizes computed; a row is
//! selected once the cumulative size ahead of it exceeds the byte budget, or
//! once it is older than the age budget while the tier holds at least
//! `min_bytes`. Event selection applies the same thresholds to whole
//! recordings, then resolves recordings back to their files.

use argus_db::{FileRecord, RecordingRecord};

use crate::proto::MoveCandidate;

/// Files pass. `min_age_ts`/`max_age_ts` are absolute unix timestamps
/// (`max_age_ts = 0` disables the age rule). Returns oldest first.
pub fn files_to_move(
    mut files: Vec<FileRecord>,
    max_bytes: i64,
    min_age_ts: i64,
    min_bytes: i64,
    max_age_ts: i64,
) -> Vec<FileRecord> {
    files.sort_by_key(|f| std::cmp::Reverse(f.orig_ctime));

    let mut cumulative: i64 = 0;
    let mut selected = Vec::new();
    for file in &files {
        cumulative += file.size;
        let over_bytes =
            max_bytes > 0 && cumulative > max_bytes && file.orig_ctime <= min_age_ts;
        let over_age =
            max_age_ts > 0 && file.orig_ctime < max_age_ts && cumulative >= min_bytes;
        if over_bytes || over_age {
            selected.push(file.clone());
        }
    }
    selected.reverse();
    selected
}

/// One recording window with the files whose capture times fall inside it.
struct RecordingGroup {
    recording_id: i64,
    created_at: i64,
    size: i64,
    file_indices: Vec<usize>,
}

/// Events pass. Thresholds are applied to recording-cumulative sizes keyed
/// on the recording's `created_at`; selected files must additionally be at
/// least `file_min_age_ts` old, and only `.m4s` files are returned. Files
/// belonging to no recording are always candidates subject to the same age
/// floor.
pub fn recordings_to_move(
    mut recordings: Vec<RecordingRecord>,
    mut files: Vec<FileRecord>,
    segment_duration: i64,
    max_bytes: i64,
    min_age_ts: i64,
    min_bytes: i64,
    max_age_ts: i64,
    file_min_age_ts: i64,
) -> Vec<MoveCandidate> {
    recordings.sort_by_key(|r| std::cmp::Reverse(r.adjusted_start_time));
    files.sort_by_key(|f| f.orig_ctime);

    let mut associated = vec![false; files.len()];
    let mut groups = Vec::with_capacity(recordings.len());
    for recording in &recordings {
        let window_start = recording.adjusted_start_time;
        let window_end = recording.end_time + segment_duration;
        let start_idx = files.partition_point(|f| f.orig_ctime < window_start);
        let end_idx = files.partition_point(|f| f.orig_ctime <= window_end);
        let mut size = 0;
        let mut file_indices = Vec::new();
        for idx in start_idx..end_idx {
            size += files[idx].size;
            file_indices.push(idx);
            associated[idx] = true;
        }
        groups.push(RecordingGroup {
            recording_id: recording.id,
            created_at: recording.created_at,
            size,
            file_indices,
        });
    }

    // Dual threshold over recording-cumulative sizes, newest recording
    // first.
    let mut cumulative = 0;
    let mut selected_groups = Vec::new();
    for group in &groups {
        cumulative += group.size;
        let over_bytes =
            max_bytes > 0 && cumulative > max_bytes && group.created_at <= min_age_ts;
        let over_age =
            max_age_ts > 0 && group.created_at < max_age_ts && cumulative >= min_bytes;
        if over_bytes || over_age {
            selected_groups.push(group);
        }
    }

    let mut candidates: Vec<MoveCandidate> = Vec::new();
    let mut taken = vec![false; files.len()];
    let mut push = |idx: usize, recording_id: Option<i64>,
                    files: &[FileRecord],
                    taken: &mut Vec<bool>,
                    candidates: &mut Vec<MoveCandidate>| {
        let file = &files[idx];
        if taken[idx] || file.orig_ctime > file_min_age_ts || !file.path.ends_with(".m4s") {
            return;
        }
        taken[idx] = true;
        candidates.push(MoveCandidate {
            recording_id,
            file_id: file.id,
            path: file.path.clone(),
            tier_path: file.tier_path.clone(),
        });
    };

    for group in &selected_groups {
        for &idx in &group.file_indices {
            push(idx, Some(group.recording_id), &files, &mut taken, &mut candidates);
        }
    }
    // Files outside every recording window are always in scope.
    for idx in 0..files.len() {
        if !associated[idx] {
            push(idx, None, &files, &mut taken, &mut candidates);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: i64, size: i64, orig_ctime: i64) -> FileRecord {
        FileRecord {
            id,
            size,
            orig_ctime,
            path: format!("/tier1/{id}.m4s"),
            tier_path: "/tier1".to_string(),
        }
    }

    fn recording(id: i64, adjusted_start: i64, end: i64, created_at: i64) -> RecordingRecord {
        RecordingRecord {
            id,
            start_time: adjusted_start + 5,
            adjusted_start_time: adjusted_start,
            end_time: end,
            created_at,
        }
    }

    #[test]
    fn oldest_files_over_byte_budget_are_selected() {
        // Sizes 1 at times 10, 9, 8, 7; budget 2 bytes.
        let files = vec![file(1, 1, 10), file(2, 1, 9), file(3, 1, 8), file(4, 1, 7)];
        let selected = files_to_move(files, 2, i64::MAX, 0, 0);
        let times: Vec<i64> = selected.iter().map(|f| f.orig_ctime).collect();
        assert_eq!(times, vec![7, 8]);
    }

    #[test]
    fn files_newer_than_min_age_are_never_selected() {
        let files = vec![file(1, 100, 100), file(2, 100, 90)];
        // Everything over budget, but min_age cutoff at 95 protects file 1.
        let selected = files_to_move(files, 1, 95, 0, 0);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 2);
    }

    #[test]
    fn age_rule_requires_min_bytes() {
        let files = vec![file(1, 10, 100), file(2, 10, 50)];
        // File 2 is older than the max-age cutoff (60) but the tier holds
        // fewer than min_bytes=100 bytes, so nothing moves.
        let selected = files_to_move(files.clone(), 0, i64::MAX, 100, 60);
        assert!(selected.is_empty());
        // With min_bytes satisfied the old file moves.
        let selected = files_to_move(files, 0, i64::MAX, 20, 60);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 2);
    }

    #[test]
    fn zero_budgets_select_nothing() {
        let files = vec![file(1, 10, 100)];
        assert!(files_to_move(files, 0, i64::MAX, 0, 0).is_empty());
    }

    #[test]
    fn recordings_group_files_by_window() {
        // Two recordings, newest first by adjusted start. Each owns two
        // 5-second segments; one stray file belongs to neither.
        let recordings = vec![
            recording(1, 100, 110, 100),
            recording(2, 200, 210, 200),
        ];
        let files = vec![
            file(1, 10, 100),
            file(2, 10, 105),
            file(3, 10, 200),
            file(4, 10, 205),
            file(5, 10, 150), // unassociated
        ];
        // Byte budget forces the older recording (id 1) out; cumulative for
        // recording 2 alone (20) is below the 30-byte budget.
        let candidates = recordings_to_move(
            recordings,
            files,
            5,
            30,
            i64::MAX,
            0,
            0,
            i64::MAX,
        );
        let mut ids: Vec<i64> = candidates.iter().map(|c| c.file_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 5]);
        assert!(candidates
            .iter()
            .filter(|c| c.file_id != 5)
            .all(|c| c.recording_id == Some(1)));
        assert!(candidates
            .iter()
            .any(|c| c.file_id == 5 && c.recording_id.is_none()));
    }

    #[test]
    fn event_files_respect_hls_age_floor() {
        let recordings = vec![recording(1, 100, 110, 100)];
        let files = vec![file(1, 10, 100), file(2, 10, 108)];
        // Recording selected, but only file 1 is older than the floor.
        let candidates =
            recordings_to_move(recordings, files, 5, 5, i64::MAX, 0, 0, 105);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].file_id, 1);
    }

    #[test]
    fn non_m4s_files_are_skipped_in_event_pass() {
        let recordings = vec![recording(1, 100, 110, 100)];
        let mut mp4 = file(1, 10, 100);
        mp4.path = "/tier1/1.mp4".to_string();
        let candidates =
            recordings_to_move(recordings, vec![mp4], 5, 5, i64::MAX, 0, 0, i64::MAX);
        assert!(candidates.is_empty());
    }

    #[test]
    fn no_selected_recordings_still_moves_unassociated_files() {
        let recordings = vec![recording(1, 100, 110, 100)];
        let files = vec![file(1, 10, 105), file(2, 10, 500)];
        // Budgets never exceeded: recording stays, stray file still moves.
        let candidates =
            recordings_to_move(recordings, files, 5, 1_000_000, i64::MAX, 0, 0, i64::MAX);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].file_id, 2);
        assert_eq!(candidates[0].recording_id, None);
    }
}
