//! Event recording lifecycle: start on trigger, close on sustained absence,
//! then concatenate the covering segments into a clip in the background.

use std::path::PathBuf;
use std::sync::Arc;

use argus::events::{EventDispatcher, EventKind};
use argus_db::Database;
use argus_types::{topics, CameraId, TriggerKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::cleanup::SegmentCleanup;
use crate::segments::{concat_segments, ConcatRunner, DurationProber};
use crate::SEGMENT_DURATION_SECS;

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub camera: CameraId,
    /// Seconds of pre-event footage included in the clip.
    pub lookback: f64,
    /// Seconds of sustained no-trigger before the pipeline ends the event.
    pub idle_timeout: f64,
    /// This camera's segment directory.
    pub segments_dir: PathBuf,
    /// Where finished clips land.
    pub recordings_dir: PathBuf,
    pub extension: String,
}

struct ActiveRecording {
    id: i64,
    start: DateTime<Utc>,
}

struct RecorderInner {
    settings: RecorderSettings,
    db: Arc<Database>,
    events: EventDispatcher,
    cleanup: SegmentCleanup,
    prober: Arc<dyn DurationProber>,
    runner: Arc<dyn ConcatRunner>,
    active: Mutex<Option<ActiveRecording>>,
    /// Serialises concat jobs for this camera.
    concat_lock: Mutex<()>,
    concat_jobs: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    pub fn new(
        settings: RecorderSettings,
        db: Arc<Database>,
        events: EventDispatcher,
        prober: Arc<dyn DurationProber>,
        runner: Arc<dyn ConcatRunner>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&settings.segments_dir)?;
        // Never prune a segment the lookback window may still need.
        let max_age = settings.lookback as i64 + 3 * SEGMENT_DURATION_SECS;
        let cleanup = SegmentCleanup::spawn(settings.segments_dir.clone(), max_age);
        Ok(Recorder {
            inner: Arc::new(RecorderInner {
                settings,
                db,
                events,
                cleanup,
                prober,
                runner,
                active: Mutex::new(None),
                concat_lock: Mutex::new(()),
                concat_jobs: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn is_recording(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    pub fn idle_timeout(&self) -> f64 {
        self.inner.settings.idle_timeout
    }

    pub fn lookback(&self) -> f64 {
        self.inner.settings.lookback
    }

    #[cfg(test)]
    pub(crate) fn cleanup_is_paused(&self) -> bool {
        self.inner.cleanup.is_paused()
    }

    /// Open an event: persist the window (with its lookback-adjusted start)
    /// and pause segment pruning.
    pub fn start(&self, trigger: TriggerKind) {
        let inner = &self.inner;
        let mut active = inner.active.lock();
        if active.is_some() {
            return;
        }
        let start = Utc::now();
        let adjusted = start.timestamp() - inner.settings.lookback as i64;
        let id = match inner.db.insert_recording(
            inner.settings.camera.as_str(),
            start.timestamp(),
            adjusted,
            trigger.as_str(),
        ) {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "could not persist recording for {}: {e}",
                    inner.settings.camera
                );
                return;
            }
        };
        inner.cleanup.pause();
        *active = Some(ActiveRecording { id, start });
        drop(active);

        info!("recording {id} started for {}", inner.settings.camera);
        inner.events.dispatch(
            &topics::recorder_start(&inner.settings.camera),
            EventKind::RecorderStart {
                camera: inner.settings.camera.clone(),
                recording_id: id,
                trigger,
                start_time: start,
            },
            true,
        );
    }

    /// Close the event and launch the background concat job.
    pub fn stop(&self) {
        let inner = &self.inner;
        let Some(recording) = inner.active.lock().take() else {
            return;
        };
        let end = Utc::now();
        if let Err(e) = inner.db.end_recording(recording.id, end.timestamp()) {
            error!("could not close recording {}: {e}", recording.id);
        }
        info!(
            "recording {} stopped for {}",
            recording.id, inner.settings.camera
        );
        inner.events.dispatch(
            &topics::recorder_stop(&inner.settings.camera),
            EventKind::RecorderStop {
                camera: inner.settings.camera.clone(),
                recording_id: recording.id,
                end_time: end,
            },
            true,
        );

        let job_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("concat-{}", inner.settings.camera))
            .spawn(move || run_concat_job(job_inner, recording, end))
            .expect("spawn concat job");
        inner.concat_jobs.lock().push(handle);
    }

    /// Stop any open event, wait for concat jobs, stop the cleanup
    /// scheduler.
    pub fn shutdown(&self) {
        if self.is_recording() {
            self.stop();
        }
        loop {
            // Concat jobs may queue further jobs only via stop(); draining
            // until empty covers a stop racing with shutdown.
            let jobs: Vec<_> = self.inner.concat_jobs.lock().drain(..).collect();
            if jobs.is_empty() {
                break;
            }
            for handle in jobs {
                let _ = handle.join();
            }
        }
        self.inner.cleanup.shutdown();
        debug!("recorder for {} stopped", self.inner.settings.camera);
    }
}

fn run_concat_job(inner: Arc<RecorderInner>, recording: ActiveRecording, end: DateTime<Utc>) {
    let _guard = inner.concat_lock.lock();
    let settings = &inner.settings;
    let event_start = recording.start.timestamp() as f64 - settings.lookback;
    let event_end = end.timestamp() as f64;
    let file_name = format!(
        "{}.{}",
        recording.start.format("%Y-%m-%d_%H-%M-%S"),
        settings.extension
    );
    let destination = settings.recordings_dir.join(file_name);

    match concat_segments(
        &settings.segments_dir,
        inner.prober.as_ref(),
        inner.runner.as_ref(),
        event_start,
        event_end,
        &destination,
    ) {
        Ok(()) => {
            if let Err(e) = inner
                .db
                .set_recording_clip(recording.id, &destination.display().to_string())
            {
                error!("could not store clip path for {}: {e}", recording.id);
            }
        }
        Err(e) => error!(
            "failed to concatenate segments for {}: {e}",
            settings.camera
        ),
    }

    // Resume pruning only if no new recording started while we worked.
    if inner.active.lock().is_none() {
        inner.cleanup.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::testing::FakeProber;
    use crate::ConcatError;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConcat {
        runs: AtomicUsize,
    }

    impl ConcatRunner for FakeConcat {
        fn run(&self, _script: &str, output: &Path) -> Result<(), ConcatError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::fs::write(output, b"clip")?;
            Ok(())
        }
    }

    fn recorder(dir: &Path) -> (Recorder, Arc<Database>, Arc<FakeConcat>) {
        let segments_dir = dir.join("segments");
        std::fs::create_dir_all(&segments_dir).unwrap();
        // One segment covering "now" so the concat window resolves.
        let now = Utc::now() - chrono::Duration::seconds(2);
        let name = format!("{}.mp4", crate::segments::format_segment_stem(now));
        std::fs::write(segments_dir.join(&name), b"x").unwrap();

        let mut durations = HashMap::new();
        durations.insert(name, 3600.0);
        let prober = Arc::new(FakeProber { durations });
        let runner = Arc::new(FakeConcat {
            runs: AtomicUsize::new(0),
        });
        let db = Arc::new(Database::memory().unwrap());
        let recorder = Recorder::new(
            RecorderSettings {
                camera: CameraId::new("cam_1"),
                lookback: 5.0,
                idle_timeout: 10.0,
                segments_dir,
                recordings_dir: dir.join("recordings"),
                extension: "mp4".to_string(),
            },
            db.clone(),
            EventDispatcher::new(),
            prober,
            runner.clone(),
        )
        .unwrap();
        (recorder, db, runner)
    }

    #[test]
    fn start_persists_window_and_pauses_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, db, _) = recorder(dir.path());

        assert!(!recorder.is_recording());
        recorder.start(TriggerKind::Object);
        assert!(recorder.is_recording());
        assert!(recorder.cleanup_is_paused());

        let id = db.active_recording("cam_1").unwrap().unwrap();
        let rows = db.recordings_for_camera("cam_1", 0).unwrap();
        let row = rows.iter().find(|r| r.id == id).unwrap();
        assert_eq!(row.start_time - row.adjusted_start_time, 5);

        // A second start while recording is a no-op.
        recorder.start(TriggerKind::Motion);
        assert_eq!(db.recordings_for_camera("cam_1", 0).unwrap().len(), 1);
        recorder.shutdown();
    }

    #[test]
    fn stop_runs_concat_and_stores_clip_path() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, db, runner) = recorder(dir.path());

        recorder.start(TriggerKind::Motion);
        recorder.stop();
        recorder.shutdown();

        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(db.active_recording("cam_1").unwrap().is_none());
        assert!(!recorder.cleanup_is_paused());
        // Clip landed in the recordings directory.
        let clips: Vec<_> = std::fs::read_dir(dir.path().join("recordings"))
            .unwrap()
            .collect();
        assert_eq!(clips.len(), 1);
    }

    #[test]
    fn shutdown_closes_open_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, db, runner) = recorder(dir.path());
        recorder.start(TriggerKind::Manual);
        recorder.shutdown();
        assert!(db.active_recording("cam_1").unwrap().is_none());
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }
}
