//! File move/delete operations executed by the worker.

use std::path::Path;

use argus_db::Database;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum OpError {
    #[error("source file {path} is missing; orphan database row deleted")]
    SourceMissing { path: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Db(#[from] argus_db::DbError),
}

/// Copy `src` to `dst`, then delete `src`. Copy-then-delete so a reader
/// holding the old path mid-stream never sees a half-missing file. A missing
/// source means the database row is stale: the row is removed and the error
/// reported to the caller.
pub fn move_file(db: &Database, src: &Path, dst: &Path) -> Result<(), OpError> {
    debug!("moving file {} to {}", src.display(), dst.display());
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|source| OpError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    match std::fs::copy(src, dst) {
        Ok(_) => {}
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            db.delete_file_by_path(&src.display().to_string())?;
            return Err(OpError::SourceMissing {
                path: src.display().to_string(),
            });
        }
        Err(source) => {
            // The row no longer matches anything servable; drop it and
            // surface the error.
            db.delete_file_by_path(&src.display().to_string())?;
            return Err(OpError::Io {
                path: src.display().to_string(),
                source,
            });
        }
    }
    if let Err(error) = std::fs::remove_file(src) {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove moved file {}: {error}", src.display());
        }
    }
    Ok(())
}

/// Delete the database row, then the file. An already-missing file counts as
/// success.
pub fn delete_file(db: &Database, src: &Path) -> Result<(), OpError> {
    debug!("deleting file {}", src.display());
    db.delete_file_by_path(&src.display().to_string())?;
    match std::fs::remove_file(src) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!("file {} was already gone", src.display());
            Ok(())
        }
        Err(source) => Err(OpError::Io {
            path: src.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_db::NewFile;

    fn db_with_file(path: &str) -> Database {
        let db = Database::memory().unwrap();
        db.insert_file(NewFile {
            camera_identifier: "cam_1",
            tier_id: 0,
            tier_path: "/tier1",
            path,
            category: "recorder",
            subcategory: "segments",
            size: 4,
            orig_ctime: 100,
        })
        .unwrap();
        db
    }

    #[test]
    fn move_copies_then_deletes_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.m4s");
        let dst = dir.path().join("tier2/a.m4s");
        std::fs::write(&src, b"data").unwrap();
        let db = db_with_file(&src.display().to_string());

        move_file(&db, &src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"data");
    }

    #[test]
    fn missing_source_removes_orphan_row() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("gone.m4s");
        let db = db_with_file(&src.display().to_string());

        let result = move_file(&db, &src, &dir.path().join("tier2/gone.m4s"));
        assert!(matches!(result, Err(OpError::SourceMissing { .. })));
        // Row is gone: a second delete touches nothing.
        assert_eq!(
            db.delete_file_by_path(&src.display().to_string()).unwrap(),
            0
        );
    }

    #[test]
    fn delete_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.m4s");
        let db = db_with_file(&src.display().to_string());

        // File never created on disk.
        delete_file(&db, &src).unwrap();
        assert_eq!(
            db.delete_file_by_path(&src.display().to_string()).unwrap(),
            0
        );

        // And with the file present it is removed.
        std::fs::write(&src, b"data").unwrap();
        delete_file(&db, &src).unwrap();
        assert!(!src.exists());
    }
}
