//! Registration of newly written segments into the files table.
//!
//! The first tier's segment directories are scanned each pass; files not yet
//! known to the database are inserted with their capture time taken from the
//! segmenter's `%Y%m%d%H%M%S` file name (file mtime as a fallback).

use std::collections::HashSet;
use std::path::Path;

use argus_db::{Database, NewFile};
use argus_types::parse_segment_stem;
use tracing::{debug, error};

pub const CATEGORY_RECORDER: &str = "recorder";
pub const SUBCATEGORY_SEGMENTS: &str = "segments";

/// Insert rows for segments in `directory` that the database has not seen
/// yet. `known` carries already-indexed paths across passes. Returns how
/// many rows were inserted.
pub fn index_segments(
    db: &Database,
    camera: &str,
    tier_id: i64,
    tier_path: &str,
    directory: &Path,
    known: &mut HashSet<String>,
) -> usize {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut inserted = 0;
    for entry in entries.flatten() {
        let path = entry.path().display().to_string();
        if known.contains(&path) {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let orig_ctime = parse_segment_stem(&file_name).unwrap_or_else(|| {
            metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default()
        });
        let result = db.insert_file(NewFile {
            camera_identifier: camera,
            tier_id,
            tier_path,
            path: &path,
            category: CATEGORY_RECORDER,
            subcategory: SUBCATEGORY_SEGMENTS,
            size: metadata.len() as i64,
            orig_ctime,
        });
        match result {
            Ok(_) => {
                known.insert(path);
                inserted += 1;
            }
            Err(e) => error!("could not index segment {path}: {e}"),
        }
    }
    if inserted > 0 {
        debug!("indexed {inserted} new segments for {camera}");
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_segments_are_indexed_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240101000000.m4s"), b"abcd").unwrap();
        std::fs::write(dir.path().join("20240101000005.m4s"), b"efgh").unwrap();
        let db = Database::memory().unwrap();
        let mut known = HashSet::new();

        assert_eq!(
            index_segments(&db, "cam_1", 0, "/tier1", dir.path(), &mut known),
            2
        );
        // A second pass adds nothing.
        assert_eq!(
            index_segments(&db, "cam_1", 0, "/tier1", dir.path(), &mut known),
            0
        );

        let files = db
            .files_for_tier("cam_1", 0, CATEGORY_RECORDER, &[SUBCATEGORY_SEGMENTS.into()])
            .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files.iter().map(|f| f.size).sum::<i64>(), 8);
        assert!(files
            .iter()
            .any(|f| f.orig_ctime == parse_segment_stem("20240101000000.m4s").unwrap()));
    }

    #[test]
    fn missing_directory_is_harmless() {
        let db = Database::memory().unwrap();
        let mut known = HashSet::new();
        assert_eq!(
            index_segments(&db, "cam_1", 0, "/tier1", Path::new("/nonexistent"), &mut known),
            0
        );
    }
}
