//! The ingest camera: supervises the decoder subprocess, relays decoded
//! frames into the shared frame store and onto the bus, and owns the
//! camera's recorder.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use argus::domains::{Camera, DomainInstance, FailedCamera};
use argus::events::{EventDispatcher, EventKind};
use argus::watchdog::{WatchToken, WatchdogHandle};
use argus::{Argus, SetupError};
use argus_config_data::CameraConfig;
use argus_db::Database;
use argus_types::{topics, CameraId, DataPayload, DetectedObject, PixelFormat, TriggerKind};
use crossbeam_channel::{bounded, Receiver, Sender};
use databus::DataBus;
use frame_store::FrameStore;
use parking_lot::Mutex;
use segment_recorder::segments::{ConcatSettings, FfmpegConcat, FfprobeDurationProber};
use segment_recorder::{Recorder, RecorderSettings};
use tracing::{debug, error, info, warn};

use crate::command::{self, CommandPlan};
use crate::probe;
use crate::stream::{read_exact_frame, Stream};
use crate::{CameraError, MAX_EMPTY_FRAMES, RESTART_PAUSE_SECS};

/// Capacity of the reader → relay handoff. Newer frames are dropped while
/// the relay is not keeping up.
const HANDOFF_CAPACITY: usize = 2;

struct CameraInner {
    identifier: CameraId,
    config: CameraConfig,
    pixel_format: PixelFormat,
    resolution: (u32, u32),
    stream_fps: f32,
    frame_bytes_size: usize,
    stream_codec: Option<String>,
    stream_audio_codec: Option<String>,
    segments_dir: PathBuf,
    output_fps: Mutex<f32>,
    bus: DataBus,
    events: EventDispatcher,
    frames: Arc<FrameStore>,
    recorder: Recorder,
    stream: Mutex<Option<Stream>>,
    capture: AtomicBool,
    connected: AtomicBool,
    decode_error: AtomicBool,
    poll_timer: Mutex<Instant>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    watchdog: WatchdogHandle,
    watch_token: Mutex<Option<WatchToken>>,
}

impl CameraInner {
    fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            self.events.dispatch(
                &topics::camera_status(&self.identifier),
                EventKind::CameraStatus {
                    camera: self.identifier.clone(),
                    connected,
                },
                true,
            );
        }
    }

    /// Sleep in small slices so shutdown is never stuck behind a restart
    /// pause.
    fn pause_while_capturing(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.capture.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn build_plan(&self) -> CommandPlan {
        let env = |key: &str| std::env::var(key).ok();
        command::build_plan(
            &env,
            &self.config,
            &self.segments_dir,
            self.stream_codec.as_deref(),
            self.stream_audio_codec.as_deref(),
            self.stream_fps,
            *self.output_fps.lock(),
        )
    }
}

#[derive(Clone)]
pub struct IngestCamera {
    inner: Arc<CameraInner>,
}

/// Camera domain setup. Missing stream parameters are probed; an
/// unreachable stream parks the camera in retry, surfacing a `FailedCamera`
/// stub until the stream comes up.
pub fn setup_camera(
    argus: &Arc<Argus>,
    db: Arc<Database>,
    identifier: &str,
    config: CameraConfig,
) -> Result<DomainInstance, SetupError> {
    let camera_id = CameraId::new(identifier);
    let output_stream = config.substream.as_ref().unwrap_or(&config.stream);

    let needs_probe = output_stream.width.is_none()
        || output_stream.height.is_none()
        || output_stream.fps.is_none()
        || output_stream.codec.is_none()
        || output_stream.audio_codec.is_none();
    let probed = if needs_probe {
        let url = command::stream_url(&config, output_stream);
        debug!(
            "probing stream information for {}",
            command::masked_url(&config, output_stream)
        );
        match probe::probe_stream(&url, &config.ffprobe_loglevel) {
            Ok(info) => Some(info),
            Err(error @ (CameraError::FfprobeTimeout { .. } | CameraError::FfprobeError(_))) => {
                argus.registry.set_error_instance(
                    argus_types::Domain::Camera,
                    identifier,
                    FailedCamera {
                        identifier: camera_id,
                        error: error.to_string(),
                    },
                );
                return Err(SetupError::not_ready(error.to_string()));
            }
            Err(error) => return Err(SetupError::failed(error.to_string())),
        }
    } else {
        None
    };

    let width = output_stream.width.or(probed.as_ref().and_then(|p| p.width));
    let height = output_stream
        .height
        .or(probed.as_ref().and_then(|p| p.height));
    let fps = output_stream.fps.or(probed.as_ref().and_then(|p| p.fps));
    let (Some(width), Some(height), Some(fps)) = (width, height, fps) else {
        let error = CameraError::StreamInformation { width, height, fps };
        argus.registry.set_error_instance(
            argus_types::Domain::Camera,
            identifier,
            FailedCamera {
                identifier: camera_id,
                error: error.to_string(),
            },
        );
        return Err(SetupError::failed(error.to_string()));
    };

    let stream_codec = output_stream
        .codec
        .clone()
        .or(probed.as_ref().and_then(|p| p.codec.clone()));
    let stream_audio_codec = match &output_stream.audio_codec {
        Some(codec) => Some(codec.clone()),
        None => probed.as_ref().and_then(|p| p.audio_codec.clone()),
    };

    let pixel_format: PixelFormat = output_stream.pix_fmt.into();
    let segments_dir =
        PathBuf::from(&config.recorder.segments_folder).join(identifier);
    let recordings_dir =
        PathBuf::from(&config.recorder.recordings_folder).join(identifier);

    let recorder = Recorder::new(
        RecorderSettings {
            camera: camera_id.clone(),
            lookback: config.recorder.lookback,
            idle_timeout: config.recorder.idle_timeout,
            segments_dir: segments_dir.clone(),
            recordings_dir,
            extension: config.recorder.extension.clone(),
        },
        db,
        argus.events.clone(),
        Arc::new(FfprobeDurationProber {
            loglevel: config.ffprobe_loglevel.clone(),
        }),
        Arc::new(FfmpegConcat {
            settings: ConcatSettings {
                hwaccel_args: config.recorder.hwaccel_args.clone(),
                codec: config.recorder.codec.clone(),
                audio_codec: config.recorder.audio_codec.clone(),
                video_filters: config.recorder.video_filters.clone(),
                audio_filters: config.recorder.audio_filters.clone(),
                output_args: config.recorder.output_args.clone(),
                loglevel: config.recorder.ffmpeg_loglevel.clone(),
            },
        }),
    )
    .map_err(|e| SetupError::failed(format!("could not initialize recorder: {e}")))?;

    info!(
        "camera {identifier} initialized: {width}x{height} @ {fps} fps ({})",
        if config.record_only {
            "record only"
        } else {
            "decoding"
        }
    );

    let inner = Arc::new(CameraInner {
        identifier: CameraId::new(identifier),
        pixel_format,
        resolution: (width, height),
        stream_fps: fps,
        frame_bytes_size: pixel_format.frame_bytes_size(width, height),
        stream_codec,
        stream_audio_codec,
        segments_dir,
        output_fps: Mutex::new(fps),
        bus: argus.bus.clone(),
        events: argus.events.clone(),
        frames: argus.frames.clone(),
        recorder,
        stream: Mutex::new(None),
        capture: AtomicBool::new(false),
        connected: AtomicBool::new(false),
        decode_error: AtomicBool::new(false),
        poll_timer: Mutex::new(Instant::now()),
        threads: Mutex::new(Vec::new()),
        watchdog: argus.watchdog.handle(),
        watch_token: Mutex::new(None),
        config,
    });
    let camera = IngestCamera { inner };
    camera.register_watchdog();

    // Record-only cameras have no pipeline to start them.
    if camera.inner.config.record_only {
        camera.start_camera();
    }

    Ok(DomainInstance::Camera(Arc::new(camera)))
}

impl IngestCamera {
    fn register_watchdog(&self) {
        let poll_inner = self.inner.clone();
        let restart_camera = self.clone();
        let token = self.inner.watchdog.register(
            &format!("camera.{}", self.inner.identifier),
            move || frame_timeout_expired(&poll_inner),
            move || {
                warn!(
                    "no frame within timeout for {}, restarting decoder",
                    restart_camera.inner.identifier
                );
                restart_camera.restart();
            },
        );
        *self.inner.watch_token.lock() = Some(token);
    }

    fn restart(&self) {
        if !self.inner.capture.load(Ordering::SeqCst) {
            return;
        }
        self.stop_camera();
        self.start_camera();
    }

    fn start_record_only(&self) {
        debug!("starting recording only mode for {}", self.inner.identifier);
        let env = |key: &str| std::env::var(key).ok();
        let args = command::build_record_only_args(
            &env,
            &self.inner.config,
            &self.inner.segments_dir,
            self.inner.stream_codec.as_deref(),
            self.inner.stream_audio_codec.as_deref(),
        );
        let plan = self.inner.build_plan();
        *self.inner.stream.lock() = Some(Stream::new(
            plan.program,
            args,
            None,
            self.inner.config.password.clone(),
        ));

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("camera.{}.segment_check", inner.identifier))
            .spawn(move || {
                {
                    let mut stream = inner.stream.lock();
                    if let Some(stream) = stream.as_mut() {
                        if let Err(e) = stream.start_pipe() {
                            error!("could not start segmenter: {e}");
                        }
                    }
                }
                while inner.capture.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_secs(1));
                    let alive = inner
                        .stream
                        .lock()
                        .as_mut()
                        .map(|s| s.decoder_alive())
                        .unwrap_or(false);
                    inner.set_connected(alive);
                    if !alive && inner.capture.load(Ordering::SeqCst) {
                        warn!("segmenter for {} exited, restarting", inner.identifier);
                        inner.pause_while_capturing(Duration::from_secs(RESTART_PAUSE_SECS));
                        let mut stream = inner.stream.lock();
                        if let Some(stream) = stream.as_mut() {
                            stream.close_decoder();
                            if let Err(e) = stream.start_pipe() {
                                error!("could not restart segmenter: {e}");
                            }
                        }
                    }
                }
                inner.set_connected(false);
            })
            .expect("spawn segment check thread");
        self.inner.threads.lock().push(handle);
    }
}

/// Watchdog staleness policy. Before the camera ever connects, twice the
/// configured timeout applies so a slow first connect is not treated as a
/// stall.
fn poll_timer_stale(
    elapsed_secs: u64,
    frame_timeout: u64,
    capturing: bool,
    record_only: bool,
    connected: bool,
) -> bool {
    if !capturing || record_only {
        return false;
    }
    if elapsed_secs > frame_timeout * 2 {
        return true;
    }
    if !connected {
        return false;
    }
    elapsed_secs > frame_timeout
}

fn frame_timeout_expired(inner: &CameraInner) -> bool {
    poll_timer_stale(
        inner.poll_timer.lock().elapsed().as_secs(),
        inner.config.stream.frame_timeout,
        inner.capture.load(Ordering::SeqCst),
        inner.config.record_only,
        inner.connected.load(Ordering::SeqCst),
    )
}

fn reader_loop(inner: Arc<CameraInner>, handoff_tx: Sender<Vec<u8>>) {
    inner.decode_error.store(false, Ordering::SeqCst);
    let mut empty_frames: u32 = 0;

    let mut stdout = {
        let mut stream = inner.stream.lock();
        let Some(stream) = stream.as_mut() else {
            return;
        };
        match stream.start_pipe() {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                error!("could not start decoder for {}: {e}", inner.identifier);
                inner.decode_error.store(true, Ordering::SeqCst);
                None
            }
        }
    };

    while inner.capture.load(Ordering::SeqCst) {
        if inner.decode_error.load(Ordering::SeqCst) {
            inner.set_connected(false);
            inner.pause_while_capturing(Duration::from_secs(RESTART_PAUSE_SECS));
            if !inner.capture.load(Ordering::SeqCst) {
                break;
            }
            error!("restarting frame pipe for {}", inner.identifier);
            let mut stream = inner.stream.lock();
            let Some(stream) = stream.as_mut() else { break };
            stream.close_decoder();
            match stream.start_pipe() {
                Ok(new_stdout) => {
                    stdout = Some(new_stdout);
                    inner.decode_error.store(false, Ordering::SeqCst);
                    empty_frames = 0;
                }
                Err(e) => {
                    error!("decoder restart failed for {}: {e}", inner.identifier);
                    continue;
                }
            }
        }

        let frame = stdout
            .as_mut()
            .and_then(|out| read_exact_frame(out, inner.frame_bytes_size));
        match frame {
            Some(bytes) => {
                empty_frames = 0;
                // Drop the frame when the relay is not keeping up.
                let _ = handoff_tx.try_send(bytes);
            }
            None => {
                let exited = inner
                    .stream
                    .lock()
                    .as_mut()
                    .map(|s| s.poll().is_some())
                    .unwrap_or(true);
                if exited {
                    if inner.capture.load(Ordering::SeqCst) {
                        error!("decoder for {} has exited", inner.identifier);
                    }
                    inner.decode_error.store(true, Ordering::SeqCst);
                    continue;
                }
                empty_frames += 1;
                if empty_frames >= MAX_EMPTY_FRAMES {
                    error!("did not receive a frame from {}", inner.identifier);
                    inner.decode_error.store(true, Ordering::SeqCst);
                }
            }
        }
    }
    debug!("frame reader for {} stopped", inner.identifier);
}

fn relay_loop(inner: Arc<CameraInner>, handoff_rx: Receiver<Vec<u8>>) {
    *inner.poll_timer.lock() = Instant::now();
    while inner.capture.load(Ordering::SeqCst) {
        let bytes = match handoff_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(bytes) => bytes,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        if bytes.len() != inner.frame_bytes_size {
            continue;
        }
        inner.set_connected(true);
        *inner.poll_timer.lock() = Instant::now();

        let frame = inner.frames.insert(
            &inner.identifier,
            inner.pixel_format,
            inner.resolution,
            bytes,
        );
        inner
            .bus
            .publish(&topics::frame_bytes(&inner.identifier), DataPayload::Frame(frame));
    }
    inner.set_connected(false);
    debug!("frame relay for {} stopped", inner.identifier);
}

impl Camera for IngestCamera {
    fn identifier(&self) -> &CameraId {
        &self.inner.identifier
    }

    fn resolution(&self) -> (u32, u32) {
        self.inner.resolution
    }

    fn output_fps(&self) -> f32 {
        *self.inner.output_fps.lock()
    }

    fn set_output_fps(&self, fps: f32) {
        // A raw command pins the pipeline's rate to the stream rate.
        if self.inner.config.raw_command.is_some() {
            *self.inner.output_fps.lock() = self.inner.stream_fps;
            return;
        }
        *self.inner.output_fps.lock() = fps;
    }

    fn start_camera(&self) {
        if self.inner.capture.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.config.record_only {
            self.start_record_only();
        } else {
            debug!("starting capture threads for {}", self.inner.identifier);
            let plan = self.inner.build_plan();
            *self.inner.stream.lock() = Some(Stream::new(
                plan.program,
                plan.decoder_args,
                plan.segmenter_args,
                self.inner.config.password.clone(),
            ));
            *self.inner.poll_timer.lock() = Instant::now();

            let (handoff_tx, handoff_rx) = bounded::<Vec<u8>>(HANDOFF_CAPACITY);
            let reader_inner = self.inner.clone();
            let relay_inner = self.inner.clone();
            let mut threads = self.inner.threads.lock();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("camera.{}.read_frames", self.inner.identifier))
                    .spawn(move || reader_loop(reader_inner, handoff_tx))
                    .expect("spawn frame reader"),
            );
            threads.push(
                std::thread::Builder::new()
                    .name(format!("camera.{}.relay_frames", self.inner.identifier))
                    .spawn(move || relay_loop(relay_inner, handoff_rx))
                    .expect("spawn frame relay"),
            );
        }
        self.inner.events.dispatch(
            &topics::camera_started(&self.inner.identifier),
            EventKind::CameraStarted {
                camera: self.inner.identifier.clone(),
            },
            true,
        );
    }

    fn stop_camera(&self) {
        if !self.inner.capture.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("stopping capture threads for {}", self.inner.identifier);
        // Killing the decoder unblocks the reader's blocking read.
        if let Some(stream) = self.inner.stream.lock().as_mut() {
            stream.close_all();
        }
        let threads: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        *self.inner.stream.lock() = None;
        self.inner.events.dispatch(
            &topics::camera_stopped(&self.inner.identifier),
            EventKind::CameraStopped {
                camera: self.inner.identifier.clone(),
            },
            true,
        );
    }

    fn is_on(&self) -> bool {
        self.inner.capture.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn is_recording(&self) -> bool {
        self.inner.recorder.is_recording()
    }

    fn start_recorder(&self, trigger: TriggerKind, _objects: &[DetectedObject]) {
        self.inner.recorder.start(trigger);
    }

    fn stop_recorder(&self) {
        self.inner.recorder.stop();
    }

    fn lookback(&self) -> f64 {
        self.inner.recorder.lookback()
    }

    fn idle_timeout(&self) -> f64 {
        self.inner.recorder.idle_timeout()
    }

    fn shutdown(&self) {
        if let Some(token) = self.inner.watch_token.lock().take() {
            self.inner.watchdog.unregister(token);
        }
        self.stop_camera();
        self.inner.recorder.shutdown();
        self.inner.frames.remove_all_for(&self.inner.identifier);
        info!("camera {} stopped", self.inner.identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> CameraConfig {
        serde_yaml::from_str(
            r#"
host: cam.example
port: 554
path: /main
width: 4
height: 4
fps: 10
codec: h264
audio_codec: none
"#,
        )
        .unwrap()
    }

    fn setup(argus: &Arc<Argus>, dir: &std::path::Path) -> Arc<dyn Camera> {
        let mut config = full_config();
        config.recorder.segments_folder = dir.join("segments").display().to_string();
        config.recorder.recordings_folder = dir.join("recordings").display().to_string();
        let db = Arc::new(Database::memory().unwrap());
        match setup_camera(argus, db, "cam_1", config).unwrap() {
            DomainInstance::Camera(camera) => camera,
            other => panic!("unexpected instance {other:?}"),
        }
    }

    #[test]
    fn fully_configured_camera_needs_no_probe() {
        let argus = Argus::new();
        let dir = tempfile::tempdir().unwrap();
        let camera = setup(&argus, dir.path());
        assert_eq!(camera.resolution(), (4, 4));
        assert_eq!(camera.output_fps(), 10.0);
        assert!(!camera.is_connected());
        assert!(!camera.is_recording());
        camera.shutdown();
        argus.stop_core();
    }

    #[test]
    fn output_fps_is_settable() {
        let argus = Argus::new();
        let dir = tempfile::tempdir().unwrap();
        let camera = setup(&argus, dir.path());
        camera.set_output_fps(2.0);
        assert_eq!(camera.output_fps(), 2.0);
        camera.shutdown();
        argus.stop_core();
    }

    #[test]
    fn frame_timeout_policy() {
        // Not capturing, or record-only: never stale.
        assert!(!poll_timer_stale(1000, 60, false, false, true));
        assert!(!poll_timer_stale(1000, 60, true, true, true));
        // Connected and past the timeout: stale.
        assert!(poll_timer_stale(61, 60, true, false, true));
        assert!(!poll_timer_stale(59, 60, true, false, true));
        // Never connected: only twice the timeout counts.
        assert!(!poll_timer_stale(100, 60, true, false, false));
        assert!(poll_timer_stale(121, 60, true, false, false));
    }
}
