//! The per-camera decision loop: frame intake, scanner fan-out, trigger
//! evaluation and recorder control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use argus::domains::{
    Camera, DomainInstance, KeepaliveCap, MotionScanner, NvrControl, ObjectScanner,
    ObjectSnapshot,
};
use argus::events::{EventDispatcher, EventKind};
use argus::{Argus, SetupError, FRAME_REMOVAL_DELAY};
use argus_types::{
    topics, CameraId, DataPayload, DetectedObject, OperationState, ProcessedFrame, ScannerKind,
    SharedFrame, TriggerKind,
};
use databus::{BusReceiver, DataBus, SubscriptionId};
use frame_store::{FrameStore, RemoverHandle};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::interval::FrameIntervalCalculator;
use crate::{MAX_PIPELINE_FRAME_AGE, SCANNER_RESULT_TIMEOUT};

/// Depth of the raw frame intake queue.
const FRAME_QUEUE_SIZE: usize = 100;

struct Shared {
    camera_id: CameraId,
    kill: AtomicBool,
    operation_state: Mutex<Option<OperationState>>,
    events: EventDispatcher,
}

impl Shared {
    fn set_operation_state(&self, state: OperationState) {
        let mut current = self.operation_state.lock();
        if *current == Some(state) {
            return;
        }
        *current = Some(state);
        drop(current);
        self.events.dispatch(
            &topics::operation_state(&self.camera_id),
            EventKind::OperationState {
                camera: self.camera_id.clone(),
                state,
            },
            true,
        );
    }
}

/// Handle to a running pipeline, stored in the registry.
pub struct NvrHandle {
    shared: Arc<Shared>,
    camera: Arc<dyn Camera>,
    frames: Arc<FrameStore>,
    bus: DataBus,
    frame_topic: String,
    frame_sub: SubscriptionId,
    frame_rx: Arc<BusReceiver>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl NvrControl for NvrHandle {
    fn camera(&self) -> CameraId {
        self.shared.camera_id.clone()
    }

    fn operation_state(&self) -> OperationState {
        self.shared
            .operation_state
            .lock()
            .unwrap_or(OperationState::Idle)
    }

    fn shutdown(&self) {
        info!("stopping NVR for camera {}", self.shared.camera_id);
        // Stop the frame source first so the intake drains.
        self.camera.stop_camera();
        self.shared.kill.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        if self.camera.is_recording() {
            self.camera.stop_recorder();
        }
        // Free anything still queued.
        while let Ok(payload) = self.frame_rx.try_recv() {
            if let DataPayload::Frame(frame) = payload {
                self.frames.remove(&frame);
            }
        }
        self.bus.unsubscribe(&self.frame_topic, self.frame_sub);
        self.frames.remove_all_for(&self.shared.camera_id);
        debug!("NVR for camera {} stopped", self.shared.camera_id);
    }
}

struct Pipeline {
    shared: Arc<Shared>,
    camera: Arc<dyn Camera>,
    motion: Option<Arc<dyn MotionScanner>>,
    object: Option<Arc<dyn ObjectScanner>>,
    motion_calc: Option<FrameIntervalCalculator>,
    object_calc: Option<FrameIntervalCalculator>,
    frames: Arc<FrameStore>,
    remover: RemoverHandle,
    bus: DataBus,
    frame_rx: Arc<BusReceiver>,
    output_fps: f32,
    start_recorder: Option<TriggerKind>,
    idle_frames: u64,
    motion_only_frames: u64,
    motion_recorder_keepalive_reached: bool,
    scanner_errors: Vec<ScannerKind>,
    fed: Vec<ScannerKind>,
}

/// NVR domain setup: resolve this camera's scanners, settle scan flags and
/// the camera's output rate, start the loop, then start the camera.
pub fn setup_nvr(argus: &Arc<Argus>, identifier: &str) -> Result<DomainInstance, SetupError> {
    let camera_id = CameraId::new(identifier);
    let camera = argus
        .registry
        .get_camera(&camera_id)
        .map_err(|e| SetupError::failed(e.to_string()))?;
    let motion = argus.registry.get_motion_scanner(&camera_id).ok();
    let object = argus.registry.get_object_scanner(&camera_id).ok();
    if motion.is_none() && object.is_none() {
        return Err(SetupError::failed(format!(
            "failed setup of nvr for camera {identifier}: at least one object or \
             motion detector has to be configured"
        )));
    }

    let motion_calc = motion.as_ref().map(|scanner| {
        FrameIntervalCalculator::new(
            argus.bus.clone(),
            argus.events.clone(),
            camera_id.clone(),
            ScannerKind::Motion,
            camera.output_fps(),
            scanner.fps(),
        )
    });
    let object_calc = object.as_ref().map(|scanner| {
        FrameIntervalCalculator::new(
            argus.bus.clone(),
            argus.events.clone(),
            camera_id.clone(),
            ScannerKind::Object,
            camera.output_fps(),
            scanner.fps(),
        )
    });

    match (&motion, &object) {
        (Some(_), Some(object)) if object.scan_on_motion_only() => {
            motion_calc.as_ref().unwrap().set_scan(true);
            object_calc.as_ref().unwrap().set_scan(false);
        }
        (Some(_), Some(_)) => {
            object_calc.as_ref().unwrap().set_scan(true);
            motion_calc.as_ref().unwrap().set_scan(false);
        }
        (None, Some(_)) => object_calc.as_ref().unwrap().set_scan(true),
        (Some(_), None) => motion_calc.as_ref().unwrap().set_scan(true),
        (None, None) => unreachable!(),
    }

    // The camera only needs to decode as fast as its hungriest scanner.
    let output_fps = [&motion_calc, &object_calc]
        .into_iter()
        .flatten()
        .map(|calc| calc.scan_fps())
        .fold(0.0f32, f32::max);
    camera.set_output_fps(output_fps);
    let output_fps = camera.output_fps();
    for calc in [&motion_calc, &object_calc].into_iter().flatten() {
        calc.calculate_scan_interval(output_fps);
    }

    let frame_topic = topics::frame_bytes(&camera_id);
    let (frame_sub, frame_rx) = argus.bus.subscribe_queue(&frame_topic, FRAME_QUEUE_SIZE);
    let frame_rx = Arc::new(frame_rx);

    let shared = Arc::new(Shared {
        camera_id: camera_id.clone(),
        kill: AtomicBool::new(false),
        operation_state: Mutex::new(None),
        events: argus.events.clone(),
    });

    let pipeline = Pipeline {
        shared: shared.clone(),
        camera: camera.clone(),
        motion,
        object,
        motion_calc,
        object_calc,
        frames: argus.frames.clone(),
        remover: argus.frame_remover.handle(),
        bus: argus.bus.clone(),
        frame_rx: frame_rx.clone(),
        output_fps,
        start_recorder: None,
        idle_frames: 0,
        motion_only_frames: 0,
        motion_recorder_keepalive_reached: false,
        scanner_errors: Vec::new(),
        fed: Vec::new(),
    };
    let thread = std::thread::Builder::new()
        .name(format!("nvr.{identifier}"))
        .spawn(move || pipeline.run())
        .map_err(|e| SetupError::failed(format!("could not spawn nvr thread: {e}")))?;

    camera.start_camera();
    info!("NVR for camera {identifier} initialized");

    Ok(DomainInstance::Nvr(Arc::new(NvrHandle {
        shared,
        camera,
        frames: argus.frames.clone(),
        bus: argus.bus.clone(),
        frame_topic,
        frame_sub,
        frame_rx,
        thread: Mutex::new(Some(thread)),
    })))
}

impl Pipeline {
    fn run(mut self) {
        debug!("waiting for first frame");
        let mut first_frame_log = true;

        while !self.shared.kill.load(Ordering::SeqCst) {
            self.update_operation_state();
            let frame = match self.frame_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(DataPayload::Frame(frame)) => frame,
                Ok(_) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            };
            if first_frame_log {
                debug!("first frame received");
                first_frame_log = false;
            }

            let age = frame.age_seconds(chrono::Utc::now());
            if age > MAX_PIPELINE_FRAME_AGE {
                debug!("frame is {age:.2} seconds old, discarding");
                self.remover.schedule(frame, FRAME_REMOVAL_DELAY);
                continue;
            }

            self.process_frame(&frame);
            self.process_recorder();
            self.publish_processed_frame(&frame);
            self.remover.schedule(frame, FRAME_REMOVAL_DELAY);
        }
        debug!("NVR thread for {} stopped", self.shared.camera_id);
    }

    fn calculators(&self) -> impl Iterator<Item = &FrameIntervalCalculator> {
        self.motion_calc.iter().chain(self.object_calc.iter())
    }

    fn process_frame(&mut self, frame: &SharedFrame) {
        self.check_intervals(frame);
        self.scanner_results();
        self.process_object_event();
        self.process_motion_event();
    }

    fn check_intervals(&mut self, frame: &SharedFrame) {
        let mut fed = Vec::new();
        for calc in self.calculators() {
            if calc.check_scan_interval(frame) {
                fed.push(calc.kind());
            }
        }
        self.fed = fed;
    }

    /// Wait for each fed scanner's result. The result content is not used
    /// here; decision logic reads scanner state directly. A timeout marks
    /// that scanner errored for this frame and the rest continue.
    fn scanner_results(&mut self) {
        let mut errors = Vec::new();
        for kind in self.fed.clone() {
            let calc = match kind {
                ScannerKind::Motion => self.motion_calc.as_ref(),
                ScannerKind::Object => self.object_calc.as_ref(),
            };
            let Some(calc) = calc else { continue };
            calc.set_scan_error(false);
            if calc.wait_result(SCANNER_RESULT_TIMEOUT).is_err() {
                if self.shared.kill.load(Ordering::SeqCst) {
                    return;
                }
                error!("failed to retrieve result for {kind}");
                calc.set_scan_error(true);
                errors.push(kind);
            }
        }
        self.scanner_errors = errors;
    }

    /// Discard an object that requires motion while none is detected;
    /// otherwise its flag decides.
    fn trigger_recorder(&self, obj: &DetectedObject, snapshot: &ObjectSnapshot) -> bool {
        if obj.trigger_event_recording {
            let requires_motion = snapshot
                .filters
                .get(&obj.label)
                .map(|f| f.require_motion)
                .unwrap_or(false);
            if requires_motion {
                if let Some(motion) = &self.motion {
                    if !motion.motion_detected() {
                        return false;
                    }
                }
            }
        }
        obj.trigger_event_recording
    }

    fn process_object_event(&mut self) {
        let Some(object) = self.object.clone() else {
            return;
        };
        if self.camera.is_recording() {
            return;
        }
        let calc = self.object_calc.as_ref().expect("object calc");
        if !calc.scan() && !calc.scan_error() {
            return;
        }
        let fov = object.fov();
        let snapshots = std::iter::once(fov).chain(object.zones());
        for snapshot in snapshots {
            for obj in &snapshot.objects {
                if self.trigger_recorder(obj, &snapshot) {
                    self.start_recorder = Some(TriggerKind::Object);
                    return;
                }
            }
        }
    }

    fn process_motion_event(&mut self) {
        let Some(motion) = self.motion.clone() else {
            return;
        };
        if self.camera.is_recording() {
            return;
        }
        let calc = self.motion_calc.as_ref().expect("motion calc");
        if !calc.scan() && !calc.scan_error() {
            return;
        }

        if motion.motion_detected() {
            if let (Some(object), Some(object_calc)) = (&self.object, &self.object_calc) {
                if object.scan_on_motion_only() && !object_calc.scan() {
                    debug!("starting object detector");
                    object_calc.set_scan(true);
                }
            }
            if motion.trigger_event_recording() && !self.camera.is_recording() {
                self.start_recorder = Some(TriggerKind::Motion);
                self.motion_only_frames = 0;
                self.motion_recorder_keepalive_reached = false;
            }
        } else if let (Some(object), Some(object_calc)) = (&self.object, &self.object_calc) {
            if object_calc.scan()
                && self.start_recorder.is_none()
                && !self.camera.is_recording()
                && object.scan_on_motion_only()
            {
                debug!("not recording, pausing object detector");
                object_calc.set_scan(false);
            }
        }
    }

    fn process_recorder(&mut self) {
        if let Some(trigger) = self.start_recorder.take() {
            self.do_start_recorder(trigger);
        } else if self.camera.is_recording() && self.event_over() {
            self.idle_frames += 1;
            self.maybe_stop_recorder();
        } else {
            self.idle_frames = 0;
        }
    }

    fn do_start_recorder(&mut self, trigger: TriggerKind) {
        self.idle_frames = 0;
        let objects = self
            .object
            .as_ref()
            .map(|o| o.fov().objects)
            .unwrap_or_default();
        self.camera.start_recorder(trigger, &objects);

        if let (Some(motion), Some(motion_calc)) = (&self.motion, &self.motion_calc) {
            if motion.recorder_keepalive() && !motion_calc.scan() {
                info!("starting motion detector");
                motion_calc.set_scan(true);
            }
        }
    }

    fn maybe_stop_recorder(&mut self) {
        let frames_per_second = self.output_fps.max(1.0) as u64;
        let idle_timeout = self.camera.idle_timeout();
        if self.idle_frames % frames_per_second == 0 {
            info!(
                "stopping recording in: {}",
                (idle_timeout - self.idle_frames as f64 / self.output_fps as f64) as i64
            );
        }
        if self.idle_frames as f64 >= self.output_fps as f64 * idle_timeout {
            if let (Some(motion), Some(object), Some(motion_calc)) =
                (&self.motion, &self.object, &self.motion_calc)
            {
                if !object.scan_on_motion_only() && !motion.trigger_event_recording() {
                    info!("pausing motion detector");
                    motion_calc.set_scan(false);
                }
            }
            self.idle_frames = 0;
            self.camera.stop_recorder();
        }
    }

    fn reset_motion_counters(&mut self) {
        self.motion_recorder_keepalive_reached = false;
        self.motion_only_frames = 0;
    }

    /// Whether motion should stop keeping the event open for this object.
    fn event_over_check_motion(&mut self, obj: &DetectedObject, snapshot: &ObjectSnapshot) -> bool {
        let requires_motion = snapshot
            .filters
            .get(&obj.label)
            .map(|f| f.require_motion)
            .unwrap_or(false);
        if requires_motion {
            let motion_detected = self
                .motion
                .as_ref()
                .map(|m| m.motion_detected())
                .unwrap_or(false);
            if motion_detected {
                self.reset_motion_counters();
                return false;
            }
        } else {
            self.reset_motion_counters();
            return false;
        }
        true
    }

    fn event_over_check_object(&mut self, obj: &DetectedObject, snapshot: &ObjectSnapshot) -> bool {
        if obj.trigger_event_recording {
            if self.motion.is_some() {
                if !self.event_over_check_motion(obj, snapshot) {
                    return false;
                }
            } else {
                return false;
            }
        }
        true
    }

    /// True once neither objects nor motion justify keeping the recording
    /// open for this frame.
    fn event_over(&mut self) -> bool {
        if let (Some(object), Some(object_calc)) = (self.object.clone(), &self.object_calc) {
            if object_calc.scan() && !object_calc.scan_error() {
                let fov = object.fov();
                let snapshots = std::iter::once(fov).chain(object.zones());
                for snapshot in snapshots {
                    for obj in snapshot.objects.clone() {
                        if !self.event_over_check_object(&obj, &snapshot) {
                            return false;
                        }
                    }
                }
            }
        }

        if let (Some(motion), Some(motion_calc)) = (&self.motion, &self.motion_calc) {
            if motion_calc.scan()
                && !motion_calc.scan_error()
                && motion.recorder_keepalive()
                && motion.motion_detected()
            {
                // Motion extends the event, but only up to the configured
                // cap.
                if let KeepaliveCap::Seconds(cap) = motion.max_recorder_keepalive() {
                    if self.motion_only_frames as f64 >= self.output_fps as f64 * cap as f64 {
                        if !self.motion_recorder_keepalive_reached {
                            self.motion_recorder_keepalive_reached = true;
                            debug!(
                                "motion has kept recorder alive for longer than \
                                 max_recorder_keepalive ({cap}s), event considered over anyway"
                            );
                        }
                        return true;
                    }
                }
                self.motion_only_frames += 1;
                return false;
            }
        }
        true
    }

    fn update_operation_state(&self) {
        let state = if !self.scanner_errors.is_empty() {
            OperationState::ErrorScanningFrame
        } else if self.camera.is_recording() {
            OperationState::Recording
        } else if !self.camera.is_on() {
            OperationState::Idle
        } else if self.object_calc.as_ref().map(|c| c.scan()) == Some(true) {
            OperationState::ScanningForObjects
        } else if self.motion_calc.as_ref().map(|c| c.scan()) == Some(true) {
            OperationState::ScanningForMotion
        } else {
            OperationState::Idle
        };
        self.shared.set_operation_state(state);
    }

    fn publish_processed_frame(&self, frame: &SharedFrame) {
        let Some(rgb) = self.frames.rgb(frame) else {
            return;
        };
        let processed = ProcessedFrame {
            camera: self.shared.camera_id.clone(),
            rgb,
            resolution: frame.resolution,
            objects: self.object.as_ref().map(|o| o.fov().objects),
            contours: self.motion.as_ref().and_then(|m| m.contours()),
            capture_time: frame.capture_time,
        };
        self.bus.publish(
            &topics::processed_frame(&self.shared.camera_id),
            DataPayload::ProcessedFrame(Arc::new(processed)),
        );
    }
}
