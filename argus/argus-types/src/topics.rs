//! Topic name construction for the data bus and the event dispatcher.
//!
//! Data topics carry frames and scanner results; event topics carry the
//! lower-rate typed events. Keeping every format string here means wildcard
//! subscribers (`processed_frame/*`) stay in sync with publishers.

use crate::{CameraId, Domain, ScannerKind};

// Data topics.

pub fn frame_bytes(camera: &CameraId) -> String {
    format!("frame_bytes/{camera}")
}

pub fn scanner_scan(camera: &CameraId, kind: ScannerKind) -> String {
    format!("scanner/{camera}/{kind}/scan")
}

pub fn scanner_result(camera: &CameraId, kind: ScannerKind) -> String {
    format!("scanner/{camera}/{kind}/result")
}

pub fn processed_frame(camera: &CameraId) -> String {
    format!("processed_frame/{camera}")
}

// Event topics.

pub fn domain_state(state: &str, domain: Domain, identifier: &str) -> String {
    format!("domain/{state}/{domain}/{identifier}")
}

pub fn domain_registered(domain: Domain) -> String {
    format!("domain_registered/{domain}")
}

pub fn domain_unregistered(domain: Domain) -> String {
    format!("domain_unregistered/{domain}")
}

pub fn operation_state(camera: &CameraId) -> String {
    format!("operation_state/{camera}")
}

pub fn scan_frames(camera: &CameraId, kind: ScannerKind) -> String {
    format!("scan_frames/{camera}/{kind}")
}

pub fn motion_detected(camera: &CameraId) -> String {
    format!("motion_detected/{camera}")
}

pub fn objects_in_fov(camera: &CameraId) -> String {
    format!("objects_in_fov/{camera}")
}

pub fn camera_started(camera: &CameraId) -> String {
    format!("camera_started/{camera}")
}

pub fn camera_stopped(camera: &CameraId) -> String {
    format!("camera_stopped/{camera}")
}

pub fn camera_status(camera: &CameraId) -> String {
    format!("camera_status/{camera}")
}

pub fn recorder_start(camera: &CameraId) -> String {
    format!("recorder/{camera}/start")
}

pub fn recorder_stop(camera: &CameraId) -> String {
    format!("recorder/{camera}/stop")
}

pub const SHUTDOWN: &str = "shutdown";
