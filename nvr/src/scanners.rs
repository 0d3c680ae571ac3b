//! Scanner runtimes: the worker threads that consume scan topics, run a
//! detector implementation, filter its output, and publish results.
//!
//! Detector algorithms are external; they plug in through [`MotionDetect`]
//! and [`ObjectDetect`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use argus::domains::{
    DomainInstance, KeepaliveCap, MotionScanner, ObjectScanner, ObjectSnapshot,
};
use argus::events::{EventDispatcher, EventKind, ListenerId};
use argus::{Argus, SetupError};
use argus_config_data::{MotionScannerConfig, ObjectScannerConfig};
use argus_db::{Database, NewObject};
use argus_types::{
    point_in_polygon, topics, CameraId, Contours, DataPayload, DetectedObject, Domain,
    LabelFilter, ScannerKind, SharedFrame,
};
use databus::{DataBus, SubscriptionId};
use frame_store::FrameStore;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Motion detector implementation boundary: packed RGB in, contours out.
pub trait MotionDetect: Send {
    fn detect(&mut self, rgb: &[u8], resolution: (u32, u32)) -> Contours;
}

/// Object detector implementation boundary: packed RGB in, raw (unfiltered)
/// objects out.
pub trait ObjectDetect: Send {
    fn detect(&mut self, rgb: &[u8], resolution: (u32, u32)) -> Vec<DetectedObject>;
}

// Motion scanner runtime.

struct MotionState {
    detected: bool,
    contours: Option<Contours>,
    active_motion_row: Option<i64>,
}

struct MotionInner {
    camera: CameraId,
    config: MotionScannerConfig,
    state: Mutex<MotionState>,
    kill: AtomicBool,
    bus: DataBus,
    events: EventDispatcher,
    db: Arc<Database>,
}

impl MotionInner {
    fn set_detected(&self, detected: bool, contours: Option<Contours>) {
        let mut state = self.state.lock();
        let max_area = contours.as_ref().map(|c| c.max_area).unwrap_or(0.0);
        state.contours = contours;
        if state.detected == detected {
            return;
        }
        state.detected = detected;
        debug!(
            "{}: {}",
            self.camera,
            if detected { "motion detected" } else { "motion stopped" }
        );
        let now = chrono::Utc::now().timestamp();
        if detected {
            match self.db.insert_motion(self.camera.as_str(), now) {
                Ok(id) => state.active_motion_row = Some(id),
                Err(e) => warn!("could not persist motion start: {e}"),
            }
        } else if let Some(id) = state.active_motion_row.take() {
            if let Err(e) = self.db.end_motion(id, now) {
                warn!("could not persist motion end: {e}");
            }
        }
        drop(state);
        self.events.dispatch(
            &topics::motion_detected(&self.camera),
            EventKind::MotionDetected {
                camera: self.camera.clone(),
                detected,
                max_area,
            },
            true,
        );
    }
}

pub struct MotionScannerRuntime {
    inner: Arc<MotionInner>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    scan_sub: (String, SubscriptionId),
    stop_listener: ListenerId,
}

/// Motion scanner domain setup around a detector implementation.
pub fn setup_motion_scanner(
    argus: &Arc<Argus>,
    db: Arc<Database>,
    identifier: &str,
    config: MotionScannerConfig,
    mut detector: Box<dyn MotionDetect>,
) -> Result<DomainInstance, SetupError> {
    let camera = CameraId::new(identifier);
    let inner = Arc::new(MotionInner {
        camera: camera.clone(),
        config,
        state: Mutex::new(MotionState {
            detected: false,
            contours: None,
            active_motion_row: None,
        }),
        kill: AtomicBool::new(false),
        bus: argus.bus.clone(),
        events: argus.events.clone(),
        db,
    });

    let scan_topic = topics::scanner_scan(&camera, ScannerKind::Motion);
    let (scan_sub, scan_rx) = argus.bus.subscribe_queue(&scan_topic, 1);

    let frames = argus.frames.clone();
    let thread_inner = inner.clone();
    let thread = std::thread::Builder::new()
        .name(format!("{identifier}.motion_detection"))
        .spawn(move || {
            while !thread_inner.kill.load(Ordering::SeqCst) {
                let frame = match scan_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(DataPayload::Frame(frame)) => frame,
                    Ok(_) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                };
                process_motion_frame(&thread_inner, &frames, &mut detector, &frame);
            }
            debug!("motion detection thread stopped");
        })
        .map_err(|e| SetupError::failed(format!("could not spawn motion scanner: {e}")))?;

    // Clear state when the pipeline turns this scanner off.
    let stop_inner = inner.clone();
    let stop_listener = argus.events.listen(
        &topics::scan_frames(&camera, ScannerKind::Motion),
        move |event| {
            if let EventKind::ScanFrames { scan: false, .. } = event.kind {
                stop_inner.set_detected(false, None);
            }
        },
    );

    Ok(DomainInstance::MotionScanner(Arc::new(MotionScannerRuntime {
        inner,
        thread: Mutex::new(Some(thread)),
        scan_sub: (scan_topic, scan_sub),
        stop_listener,
    })))
}

fn process_motion_frame(
    inner: &MotionInner,
    frames: &FrameStore,
    detector: &mut Box<dyn MotionDetect>,
    frame: &SharedFrame,
) {
    let Some(rgb) = frames.rgb(frame) else {
        debug!("frame {} already freed, skipping", frame.frame_id);
        return;
    };
    let contours = detector.detect(&rgb, frame.resolution);
    debug!("max motion area: {}", contours.max_area);
    let detected = contours.max_area > inner.config.area;
    inner.set_detected(detected, Some(contours.clone()));
    inner.bus.publish(
        &topics::scanner_result(&inner.camera, ScannerKind::Motion),
        DataPayload::MotionResult(Arc::new(contours)),
    );
}

impl MotionScanner for MotionScannerRuntime {
    fn fps(&self) -> f32 {
        self.inner.config.fps
    }

    fn motion_detected(&self) -> bool {
        self.inner.state.lock().detected
    }

    fn contours(&self) -> Option<Contours> {
        self.inner.state.lock().contours.clone()
    }

    fn trigger_event_recording(&self) -> bool {
        self.inner.config.trigger_event_recording
    }

    fn recorder_keepalive(&self) -> bool {
        self.inner.config.recorder_keepalive
    }

    fn max_recorder_keepalive(&self) -> KeepaliveCap {
        KeepaliveCap::from_config_seconds(self.inner.config.max_recorder_keepalive)
    }

    fn shutdown(&self) {
        self.inner.kill.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.inner.bus.unsubscribe(&self.scan_sub.0, self.scan_sub.1);
        self.inner.events.unlisten(self.stop_listener);
    }
}

// Object scanner runtime.

struct ZoneRuntime {
    name: String,
    polygon: Vec<(f32, f32)>,
    filters: Arc<HashMap<String, LabelFilter>>,
    objects: Mutex<Vec<DetectedObject>>,
}

struct ObjectInner {
    camera: CameraId,
    config: ObjectScannerConfig,
    filters: Arc<HashMap<String, LabelFilter>>,
    zones: Vec<ZoneRuntime>,
    mask: Vec<Vec<(f32, f32)>>,
    scan_on_motion_only: bool,
    fov_objects: Mutex<Vec<DetectedObject>>,
    last_store: Mutex<HashMap<String, i64>>,
    kill: AtomicBool,
    bus: DataBus,
    events: EventDispatcher,
    db: Arc<Database>,
}

impl ObjectInner {
    fn set_fov_objects(&self, objects: Vec<DetectedObject>) {
        {
            let mut fov = self.fov_objects.lock();
            if *fov == objects {
                return;
            }
            *fov = objects.clone();
        }
        self.events.dispatch(
            &topics::objects_in_fov(&self.camera),
            EventKind::ObjectsInFov {
                camera: self.camera.clone(),
                objects,
            },
            true,
        );
    }

    fn clear(&self) {
        self.set_fov_objects(Vec::new());
        for zone in &self.zones {
            zone.objects.lock().clear();
        }
    }
}

pub struct ObjectScannerRuntime {
    inner: Arc<ObjectInner>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    scan_sub: (String, SubscriptionId),
    stop_listener: ListenerId,
}

fn rel_polygon(points: &[argus_types::Point], resolution: (u32, u32)) -> Vec<(f32, f32)> {
    let (w, h) = (resolution.0 as f32, resolution.1 as f32);
    points
        .iter()
        .map(|p| (p.x as f32 / w, p.y as f32 / h))
        .collect()
}

/// Object scanner domain setup around a detector implementation.
/// `resolution` is the owning camera's resolution, used to scale masks and
/// zone polygons.
pub fn setup_object_scanner(
    argus: &Arc<Argus>,
    db: Arc<Database>,
    identifier: &str,
    config: ObjectScannerConfig,
    resolution: (u32, u32),
    mut detector: Box<dyn ObjectDetect>,
) -> Result<DomainInstance, SetupError> {
    let camera = CameraId::new(identifier);

    let filters: HashMap<String, LabelFilter> = config
        .labels
        .iter()
        .map(|label| (label.label.clone(), label.to_filter()))
        .collect();
    let zones: Vec<ZoneRuntime> = config
        .zones
        .iter()
        .map(|zone| ZoneRuntime {
            name: zone.name.clone(),
            polygon: rel_polygon(&zone.coordinates, resolution),
            filters: Arc::new(
                zone.labels
                    .iter()
                    .map(|label| (label.label.clone(), label.to_filter()))
                    .collect(),
            ),
            objects: Mutex::new(Vec::new()),
        })
        .collect();
    if filters.is_empty() && zones.is_empty() {
        warn!("no labels or zones configured for {identifier}, no objects will be detected");
    }
    let mask: Vec<Vec<(f32, f32)>> = config
        .mask
        .iter()
        .map(|m| rel_polygon(&m.coordinates, resolution))
        .collect();

    let mut scan_on_motion_only = config.scan_on_motion_only;
    if scan_on_motion_only
        && !argus
            .registry
            .is_configured(Domain::MotionDetector, identifier)
    {
        warn!(
            "scan_on_motion_only is enabled but no motion detector is configured, \
             disabling scan_on_motion_only"
        );
        scan_on_motion_only = false;
    }

    let inner = Arc::new(ObjectInner {
        camera: camera.clone(),
        filters: Arc::new(filters),
        zones,
        mask,
        scan_on_motion_only,
        fov_objects: Mutex::new(Vec::new()),
        last_store: Mutex::new(HashMap::new()),
        kill: AtomicBool::new(false),
        bus: argus.bus.clone(),
        events: argus.events.clone(),
        db,
        config,
    });

    let scan_topic = topics::scanner_scan(&camera, ScannerKind::Object);
    let (scan_sub, scan_rx) = argus.bus.subscribe_queue(&scan_topic, 1);

    let frames = argus.frames.clone();
    let thread_inner = inner.clone();
    let thread = std::thread::Builder::new()
        .name(format!("{identifier}.object_detection"))
        .spawn(move || {
            while !thread_inner.kill.load(Ordering::SeqCst) {
                let frame = match scan_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(DataPayload::Frame(frame)) => frame,
                    Ok(_) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                };
                let age = frame.age_seconds(chrono::Utc::now());
                if age > thread_inner.config.max_frame_age {
                    debug!("frame is {age:.2} seconds old, discarding");
                    continue;
                }
                process_object_frame(&thread_inner, &frames, &mut detector, &frame);
            }
            debug!("object detection thread stopped");
        })
        .map_err(|e| SetupError::failed(format!("could not spawn object scanner: {e}")))?;

    let stop_inner = inner.clone();
    let stop_listener = argus.events.listen(
        &topics::scan_frames(&camera, ScannerKind::Object),
        move |event| {
            if let EventKind::ScanFrames { scan: false, .. } = event.kind {
                stop_inner.clear();
            }
        },
    );

    Ok(DomainInstance::ObjectScanner(Arc::new(ObjectScannerRuntime {
        inner,
        thread: Mutex::new(Some(thread)),
        scan_sub: (scan_topic, scan_sub),
        stop_listener,
    })))
}

/// Apply the field-of-view filters: only objects passing their label filter
/// are relevant; the filter also decides recording triggers and storage.
fn filter_fov(inner: &ObjectInner, objects: &[DetectedObject]) -> Vec<DetectedObject> {
    let mut relevant = Vec::new();
    for obj in objects {
        let Some(filter) = inner.filters.get(&obj.label) else {
            continue;
        };
        if !filter.passes(obj) {
            continue;
        }
        if inner
            .mask
            .iter()
            .any(|polygon| point_in_polygon(obj.rel_bottom_center(), polygon))
        {
            continue;
        }
        let mut obj = obj.clone();
        obj.relevant = true;
        obj.trigger_event_recording = filter.trigger_event_recording;
        obj.store = filter.store;
        relevant.push(obj);
    }
    relevant
}

fn filter_zones(inner: &ObjectInner, objects: &[DetectedObject]) {
    for zone in &inner.zones {
        let mut in_zone = Vec::new();
        for obj in objects {
            let Some(filter) = zone.filters.get(&obj.label) else {
                continue;
            };
            if !filter.passes(obj) || !point_in_polygon(obj.rel_bottom_center(), &zone.polygon) {
                continue;
            }
            let mut obj = obj.clone();
            obj.relevant = true;
            obj.trigger_event_recording = filter.trigger_event_recording;
            obj.store = filter.store;
            in_zone.push(obj);
        }
        *zone.objects.lock() = in_zone;
    }
}

/// Persist relevant objects flagged for storage, rate limited per label.
fn store_objects(inner: &ObjectInner, objects: &[DetectedObject], now: i64) {
    let mut last_store = inner.last_store.lock();
    for obj in objects.iter().filter(|o| o.store) {
        let interval = inner
            .filters
            .get(&obj.label)
            .map(|f| f.store_interval as i64)
            .unwrap_or(0);
        let last = last_store.get(&obj.label).copied().unwrap_or(i64::MIN);
        if now - last < interval {
            continue;
        }
        last_store.insert(obj.label.clone(), now);
        let result = inner.db.insert_object(NewObject {
            camera_identifier: inner.camera.as_str(),
            label: &obj.label,
            confidence: obj.confidence,
            x1: obj.rel_x1,
            y1: obj.rel_y1,
            x2: obj.rel_x2,
            y2: obj.rel_y2,
            width: obj.rel_width,
            height: obj.rel_height,
            snapshot_path: None,
            zone: None,
        });
        if let Err(e) = result {
            warn!("could not persist object: {e}");
        }
    }
}

fn process_object_frame(
    inner: &ObjectInner,
    frames: &FrameStore,
    detector: &mut Box<dyn ObjectDetect>,
    frame: &SharedFrame,
) {
    let Some(rgb) = frames.rgb(frame) else {
        debug!("frame {} already freed, skipping", frame.frame_id);
        return;
    };
    let raw_objects = detector.detect(&rgb, frame.resolution);
    let relevant = filter_fov(inner, &raw_objects);
    if inner.config.log_all_objects {
        debug!("all objects: {raw_objects:?}");
    } else {
        debug!("objects: {relevant:?}");
    }
    filter_zones(inner, &relevant);
    store_objects(inner, &relevant, chrono::Utc::now().timestamp());
    inner.set_fov_objects(relevant.clone());
    inner.bus.publish(
        &topics::scanner_result(&inner.camera, ScannerKind::Object),
        DataPayload::ObjectResult(Arc::new(relevant)),
    );
}

impl ObjectScanner for ObjectScannerRuntime {
    fn fps(&self) -> f32 {
        self.inner.config.fps
    }

    fn scan_on_motion_only(&self) -> bool {
        self.inner.scan_on_motion_only
    }

    fn fov(&self) -> ObjectSnapshot {
        ObjectSnapshot {
            zone: None,
            objects: self.inner.fov_objects.lock().clone(),
            filters: self.inner.filters.clone(),
        }
    }

    fn zones(&self) -> Vec<ObjectSnapshot> {
        self.inner
            .zones
            .iter()
            .map(|zone| ObjectSnapshot {
                zone: Some(zone.name.clone()),
                objects: zone.objects.lock().clone(),
                filters: zone.filters.clone(),
            })
            .collect()
    }

    fn shutdown(&self) {
        self.inner.kill.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.inner.bus.unsubscribe(&self.scan_sub.0, self.scan_sub.1);
        self.inner.events.unlisten(self.stop_listener);
    }
}
