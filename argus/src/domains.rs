//! Traits at the seams between the pipeline and its collaborators.
//!
//! One implementation of each trait may be bound per (domain, camera) pair in
//! the registry. Instances are a closed enum so lookups stay typed; the
//! post-processor variant is the extension point for recognition domains.

use std::collections::HashMap;
use std::sync::Arc;

use argus_types::{
    CameraId, Contours, DetectedObject, LabelFilter, OperationState, TriggerKind,
};

/// Bound on how long motion alone may keep a recording alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveCap {
    /// Motion extends the recording indefinitely.
    NoCap,
    Seconds(u32),
}

impl KeepaliveCap {
    /// Config encodes "no cap" as zero.
    pub fn from_config_seconds(seconds: u32) -> Self {
        if seconds == 0 {
            KeepaliveCap::NoCap
        } else {
            KeepaliveCap::Seconds(seconds)
        }
    }
}

/// A configured video source.
pub trait Camera: Send + Sync {
    fn identifier(&self) -> &CameraId;
    fn resolution(&self) -> (u32, u32);
    /// Frames per second delivered on `frame_bytes/<camera>`; the minimum
    /// needed by the camera's scanners.
    fn output_fps(&self) -> f32;
    fn set_output_fps(&self, fps: f32);
    fn start_camera(&self);
    fn stop_camera(&self);
    /// Whether capture has been started (independent of stream health).
    fn is_on(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn is_recording(&self) -> bool;
    fn start_recorder(&self, trigger: TriggerKind, objects: &[DetectedObject]);
    fn stop_recorder(&self);
    /// Seconds of pre-event footage included in recordings.
    fn lookback(&self) -> f64;
    /// Seconds of sustained no-trigger before a recording ends.
    fn idle_timeout(&self) -> f64;
    fn shutdown(&self);
}

/// Per-scope view of an object scanner's current detections: the field of
/// view or one zone, with the filters that scope applies.
#[derive(Clone)]
pub struct ObjectSnapshot {
    /// Zone name; `None` for the field of view.
    pub zone: Option<String>,
    pub objects: Vec<DetectedObject>,
    pub filters: Arc<HashMap<String, LabelFilter>>,
}

pub trait MotionScanner: Send + Sync {
    fn fps(&self) -> f32;
    fn motion_detected(&self) -> bool;
    fn contours(&self) -> Option<Contours>;
    /// Whether detected motion alone should start the recorder.
    fn trigger_event_recording(&self) -> bool;
    /// Whether ongoing motion should keep a recording alive.
    fn recorder_keepalive(&self) -> bool;
    fn max_recorder_keepalive(&self) -> KeepaliveCap;
    fn shutdown(&self);
}

pub trait ObjectScanner: Send + Sync {
    fn fps(&self) -> f32;
    /// Whether object scanning is gated on detected motion.
    fn scan_on_motion_only(&self) -> bool;
    fn fov(&self) -> ObjectSnapshot;
    fn zones(&self) -> Vec<ObjectSnapshot>;
    fn shutdown(&self);
}

/// Handle to a running per-camera pipeline.
pub trait NvrControl: Send + Sync {
    fn camera(&self) -> CameraId;
    fn operation_state(&self) -> OperationState;
    fn shutdown(&self);
}

/// Recognition domains (face, license plate, classification) downstream of
/// the object scanner.
pub trait PostProcessor: Send + Sync {
    fn shutdown(&self);
}

/// Stub kept in the registry when a camera fails setup, so consumers can
/// still list it alongside its error.
#[derive(Debug, Clone)]
pub struct FailedCamera {
    pub identifier: CameraId,
    pub error: String,
}

#[derive(Clone)]
pub enum DomainInstance {
    Camera(Arc<dyn Camera>),
    MotionScanner(Arc<dyn MotionScanner>),
    ObjectScanner(Arc<dyn ObjectScanner>),
    Nvr(Arc<dyn NvrControl>),
    PostProcessor(Arc<dyn PostProcessor>),
}

impl DomainInstance {
    pub fn shutdown(&self) {
        match self {
            DomainInstance::Camera(c) => c.shutdown(),
            DomainInstance::MotionScanner(m) => m.shutdown(),
            DomainInstance::ObjectScanner(o) => o.shutdown(),
            DomainInstance::Nvr(n) => n.shutdown(),
            DomainInstance::PostProcessor(p) => p.shutdown(),
        }
    }

    pub fn as_camera(&self) -> Option<Arc<dyn Camera>> {
        match self {
            DomainInstance::Camera(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_motion_scanner(&self) -> Option<Arc<dyn MotionScanner>> {
        match self {
            DomainInstance::MotionScanner(m) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn as_object_scanner(&self) -> Option<Arc<dyn ObjectScanner>> {
        match self {
            DomainInstance::ObjectScanner(o) => Some(o.clone()),
            _ => None,
        }
    }

    pub fn as_nvr(&self) -> Option<Arc<dyn NvrControl>> {
        match self {
            DomainInstance::Nvr(n) => Some(n.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for DomainInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DomainInstance::Camera(_) => "Camera",
            DomainInstance::MotionScanner(_) => "MotionScanner",
            DomainInstance::ObjectScanner(_) => "ObjectScanner",
            DomainInstance::Nvr(_) => "Nvr",
            DomainInstance::PostProcessor(_) => "PostProcessor",
        };
        f.write_str(name)
    }
}
