//! SQLite persistence for recordings, files, detections and post-processor
//! results.
//!
//! Sessions are per operation: every method takes the connection lock, runs
//! one statement (or a short transaction), and releases. Timestamps are unix
//! seconds throughout; the storage math works on integers.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// One `files` row as consumed by the tier checker.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub size: i64,
    pub orig_ctime: i64,
    pub path: String,
    pub tier_path: String,
}

/// One `recordings` row as consumed by the tier checker. `end_time` of an
/// open recording is substituted with the caller's `now`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRecord {
    pub id: i64,
    pub start_time: i64,
    pub adjusted_start_time: i64,
    pub end_time: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub camera_identifier: &'a str,
    pub tier_id: i64,
    pub tier_path: &'a str,
    pub path: &'a str,
    pub category: &'a str,
    pub subcategory: &'a str,
    pub size: i64,
    pub orig_ctime: i64,
}

#[derive(Debug, Clone)]
pub struct NewObject<'a> {
    pub camera_identifier: &'a str,
    pub label: &'a str,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub width: f32,
    pub height: f32,
    pub snapshot_path: Option<&'a str>,
    pub zone: Option<&'a str>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recordings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_identifier TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    adjusted_start_time INTEGER NOT NULL,
    end_time INTEGER,
    created_at INTEGER NOT NULL,
    trigger_type TEXT NOT NULL,
    clip_path TEXT
);
CREATE INDEX IF NOT EXISTS idx_recordings_camera ON recordings(camera_identifier);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_identifier TEXT NOT NULL,
    tier_id INTEGER NOT NULL,
    tier_path TEXT NOT NULL,
    path TEXT NOT NULL UNIQUE,
    category TEXT NOT NULL,
    subcategory TEXT NOT NULL,
    size INTEGER NOT NULL,
    orig_ctime INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_tier
    ON files(camera_identifier, tier_id, category, subcategory);

CREATE TABLE IF NOT EXISTS files_meta (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    meta TEXT NOT NULL,
    orig_ctime INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_identifier TEXT NOT NULL,
    label TEXT NOT NULL,
    confidence REAL NOT NULL,
    x1 REAL NOT NULL,
    y1 REAL NOT NULL,
    x2 REAL NOT NULL,
    y2 REAL NOT NULL,
    width REAL NOT NULL,
    height REAL NOT NULL,
    snapshot_path TEXT,
    zone TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS motion (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_identifier TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    snapshot_path TEXT
);

CREATE TABLE IF NOT EXISTS post_processor_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    camera_identifier TEXT NOT NULL,
    domain TEXT NOT NULL,
    snapshot_path TEXT,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
";

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and the worker subprocess's unit
    /// tests.
    pub fn memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // Recordings.

    pub fn insert_recording(
        &self,
        camera: &str,
        start_time: i64,
        adjusted_start_time: i64,
        trigger_type: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO recordings \
             (camera_identifier, start_time, adjusted_start_time, created_at, trigger_type) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![camera, start_time, adjusted_start_time, now_ts(), trigger_type],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn end_recording(&self, id: i64, end_time: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE recordings SET end_time = ?1 WHERE id = ?2",
            params![end_time, id],
        )?;
        Ok(())
    }

    pub fn set_recording_clip(&self, id: i64, clip_path: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE recordings SET clip_path = ?1 WHERE id = ?2",
            params![clip_path, id],
        )?;
        Ok(())
    }

    /// The camera's open recording, if any.
    pub fn active_recording(&self, camera: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM recordings \
                 WHERE camera_identifier = ?1 AND end_time IS NULL \
                 ORDER BY id DESC LIMIT 1",
                params![camera],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// All recordings for a camera; open windows get `now` as their end.
    pub fn recordings_for_camera(&self, camera: &str, now: i64) -> Result<Vec<RecordingRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, start_time, adjusted_start_time, COALESCE(end_time, ?2), created_at \
             FROM recordings WHERE camera_identifier = ?1",
        )?;
        let rows = stmt.query_map(params![camera, now], |row| {
            Ok(RecordingRecord {
                id: row.get(0)?,
                start_time: row.get(1)?,
                adjusted_start_time: row.get(2)?,
                end_time: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // Files.

    pub fn insert_file(&self, file: NewFile<'_>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO files \
             (camera_identifier, tier_id, tier_path, path, category, subcategory, \
              size, orig_ctime, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                file.camera_identifier,
                file.tier_id,
                file.tier_path,
                file.path,
                file.category,
                file.subcategory,
                file.size,
                file.orig_ctime,
                now_ts(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_file_by_path(&self, path: &str) -> Result<usize> {
        Ok(self
            .conn
            .lock()
            .execute("DELETE FROM files WHERE path = ?1", params![path])?)
    }

    /// Rewrite a row after its file moved to another tier.
    pub fn update_file_tier(
        &self,
        old_path: &str,
        new_tier_id: i64,
        new_tier_path: &str,
        new_path: &str,
    ) -> Result<usize> {
        Ok(self.conn.lock().execute(
            "UPDATE files SET tier_id = ?2, tier_path = ?3, path = ?4 WHERE path = ?1",
            params![old_path, new_tier_id, new_tier_path, new_path],
        )?)
    }

    pub fn files_for_tier(
        &self,
        camera: &str,
        tier_id: i64,
        category: &str,
        subcategories: &[String],
    ) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock();
        // Subcategory filtering happens here rather than in SQL to keep the
        // statement cacheable for any number of subcategories.
        let mut stmt = conn.prepare(
            "SELECT id, size, orig_ctime, path, tier_path, subcategory FROM files \
             WHERE camera_identifier = ?1 AND tier_id = ?2 AND category = ?3",
        )?;
        let rows = stmt.query_map(params![camera, tier_id, category], |row| {
            Ok((
                FileRecord {
                    id: row.get(0)?,
                    size: row.get(1)?,
                    orig_ctime: row.get(2)?,
                    path: row.get(3)?,
                    tier_path: row.get(4)?,
                },
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut files = Vec::new();
        for row in rows {
            let (record, subcategory) = row?;
            if subcategories.iter().any(|s| s == &subcategory) {
                files.push(record);
            }
        }
        Ok(files)
    }

    // Files meta.

    pub fn upsert_files_meta(&self, path: &str, meta_json: &str, orig_ctime: i64) -> Result<()> {
        let now = now_ts();
        self.conn.lock().execute(
            "INSERT INTO files_meta (path, meta, orig_ctime, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4) \
             ON CONFLICT(path) DO UPDATE SET meta = ?2, orig_ctime = ?3, updated_at = ?4",
            params![path, meta_json, orig_ctime, now],
        )?;
        Ok(())
    }

    // Objects and motion.

    pub fn insert_object(&self, object: NewObject<'_>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO objects \
             (camera_identifier, label, confidence, x1, y1, x2, y2, width, height, \
              snapshot_path, zone, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                object.camera_identifier,
                object.label,
                object.confidence,
                object.x1,
                object.y1,
                object.x2,
                object.y2,
                object.width,
                object.height,
                object.snapshot_path,
                object.zone,
                now_ts(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_motion(&self, camera: &str, start_time: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO motion (camera_identifier, start_time) VALUES (?1, ?2)",
            params![camera, start_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn end_motion(&self, id: i64, end_time: i64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE motion SET end_time = ?1 WHERE id = ?2",
            params![end_time, id],
        )?;
        Ok(())
    }

    pub fn insert_post_processor_result(
        &self,
        camera: &str,
        domain: &str,
        snapshot_path: Option<&str>,
        data_json: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO post_processor_results \
             (camera_identifier, domain, snapshot_path, data, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![camera, domain, snapshot_path, data_json, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(camera: &str, path: &str, size: i64, orig_ctime: i64) -> NewFile<'static> {
        NewFile {
            camera_identifier: Box::leak(camera.to_string().into_boxed_str()),
            tier_id: 0,
            tier_path: "/tier1",
            path: Box::leak(path.to_string().into_boxed_str()),
            category: "recorder",
            subcategory: "segments",
            size,
            orig_ctime,
        }
    }

    #[test]
    fn recording_lifecycle() {
        let db = Database::memory().unwrap();
        let id = db.insert_recording("cam_1", 100, 95, "object").unwrap();
        assert_eq!(db.active_recording("cam_1").unwrap(), Some(id));

        db.end_recording(id, 160).unwrap();
        db.set_recording_clip(id, "/recordings/x.mp4").unwrap();
        assert_eq!(db.active_recording("cam_1").unwrap(), None);

        let recordings = db.recordings_for_camera("cam_1", 999).unwrap();
        assert_eq!(recordings.len(), 1);
        assert_eq!(recordings[0].start_time, 100);
        assert_eq!(recordings[0].adjusted_start_time, 95);
        assert_eq!(recordings[0].end_time, 160);
    }

    #[test]
    fn open_recording_end_time_defaults_to_now() {
        let db = Database::memory().unwrap();
        db.insert_recording("cam_1", 100, 95, "motion").unwrap();
        let recordings = db.recordings_for_camera("cam_1", 500).unwrap();
        assert_eq!(recordings[0].end_time, 500);
    }

    #[test]
    fn files_filtered_by_tier_and_subcategory() {
        let db = Database::memory().unwrap();
        db.insert_file(file("cam_1", "/tier1/a.m4s", 10, 100)).unwrap();
        db.insert_file(file("cam_1", "/tier1/b.m4s", 20, 200)).unwrap();
        db.insert_file(file("cam_2", "/tier1/c.m4s", 30, 300)).unwrap();

        let files = db
            .files_for_tier("cam_1", 0, "recorder", &["segments".to_string()])
            .unwrap();
        assert_eq!(files.len(), 2);

        let none = db
            .files_for_tier("cam_1", 0, "recorder", &["thumbnails".to_string()])
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn file_move_and_delete() {
        let db = Database::memory().unwrap();
        db.insert_file(file("cam_1", "/tier1/a.m4s", 10, 100)).unwrap();
        assert_eq!(
            db.update_file_tier("/tier1/a.m4s", 1, "/tier2", "/tier2/a.m4s")
                .unwrap(),
            1
        );
        let files = db
            .files_for_tier("cam_1", 1, "recorder", &["segments".to_string()])
            .unwrap();
        assert_eq!(files[0].path, "/tier2/a.m4s");
        assert_eq!(db.delete_file_by_path("/tier2/a.m4s").unwrap(), 1);
        assert_eq!(db.delete_file_by_path("/tier2/a.m4s").unwrap(), 0);
    }

    #[test]
    fn files_meta_upsert() {
        let db = Database::memory().unwrap();
        db.upsert_files_meta("/tier1/a.m4s", "{\"d\":5}", 100).unwrap();
        db.upsert_files_meta("/tier1/a.m4s", "{\"d\":6}", 100).unwrap();
        let count: i64 = db
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM files_meta", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
