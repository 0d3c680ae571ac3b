//! Shared value types for the argus NVR core.
//!
//! Everything here is plain data: identifiers, frame descriptors, detection
//! results and the payload enums carried on the data bus. Runtime state
//! (pools, registries, threads) lives in the crates that own it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod topics;

/// Length in seconds of one continuous video segment written by a camera's
/// segmenter. The recorder's lookback math and the storage engine's age
/// floors both assume this bound.
pub const SEGMENT_DURATION_SECS: i64 = 5;

/// Parse the start timestamp out of a `%Y%m%d%H%M%S.<ext>` segment file
/// name, as written by the camera's segmenter.
pub fn parse_segment_stem(file_name: &str) -> Option<i64> {
    let stem = file_name.split('.').next()?;
    let parsed = chrono::NaiveDateTime::parse_from_str(stem, "%Y%m%d%H%M%S").ok()?;
    Some(parsed.and_utc().timestamp())
}

/// Start timestamp formatted back into a segment file name stem.
pub fn format_segment_stem(start: DateTime<Utc>) -> String {
    start.format("%Y%m%d%H%M%S").to_string()
}

/// Stable string key assigned to a camera in configuration. All per-camera
/// resources key off it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        CameraId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for CameraId {
    fn from(s: &str) -> Self {
        CameraId(s.to_string())
    }
}

/// A capability slot to which one implementation may be bound per camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Camera,
    MotionDetector,
    ObjectDetector,
    FaceRecognition,
    LicensePlateRecognition,
    ImageClassification,
    Nvr,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Camera => "camera",
            Domain::MotionDetector => "motion_detector",
            Domain::ObjectDetector => "object_detector",
            Domain::FaceRecognition => "face_recognition",
            Domain::LicensePlateRecognition => "license_plate_recognition",
            Domain::ImageClassification => "image_classification",
            Domain::Nvr => "nvr",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain that consumes frames at a configured rate and produces results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScannerKind {
    Motion,
    Object,
}

impl ScannerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerKind::Motion => "motion_detector",
            ScannerKind::Object => "object_detector",
        }
    }
}

impl std::fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused an event recording to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Motion,
    Object,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Motion => "motion",
            TriggerKind::Object => "object",
            TriggerKind::Manual => "manual",
        }
    }
}

/// Raw pixel layout of decoded frames on the camera pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Nv12,
    Yuv420p,
}

impl PixelFormat {
    /// Size in bytes of one raw frame at the given resolution.
    pub fn frame_bytes_size(&self, width: u32, height: u32) -> usize {
        // Both formats are 4:2:0: 12 bits per pixel.
        (width as usize * height as usize * 3) / 2
    }

    /// Dimensions of the stacked color planes as read off the pipe.
    pub fn color_plane_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (width, height + height / 2)
    }
}

/// Metadata descriptor for a decoded frame held in the frame store.
///
/// The descriptor is freely clonable; the pixel data itself is owned by the
/// store and borrowed through it.
#[derive(Debug, Clone)]
pub struct SharedFrame {
    pub frame_id: u64,
    pub camera: CameraId,
    pub pixel_format: PixelFormat,
    pub color_plane_width: u32,
    pub color_plane_height: u32,
    /// Natural (width, height) of the decoded image.
    pub resolution: (u32, u32),
    pub capture_time: DateTime<Utc>,
}

impl SharedFrame {
    /// Age of the frame relative to `now`, in seconds.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.capture_time).num_milliseconds() as f64 / 1000.0
    }
}

/// An absolute pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// One object reported by an object scanner.
///
/// Coordinates are kept both relative (0..1) and absolute (pixels). The three
/// flags are set by downstream filtering, never by the detector itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    pub rel_x1: f32,
    pub rel_y1: f32,
    pub rel_x2: f32,
    pub rel_y2: f32,
    pub abs_x1: u32,
    pub abs_y1: u32,
    pub abs_x2: u32,
    pub abs_y2: u32,
    pub rel_width: f32,
    pub rel_height: f32,
    pub abs_width: u32,
    pub abs_height: u32,
    pub trigger_event_recording: bool,
    pub store: bool,
    pub relevant: bool,
}

fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

impl DetectedObject {
    pub fn from_relative(
        label: &str,
        confidence: f32,
        (x1, y1, x2, y2): (f32, f32, f32, f32),
        resolution: (u32, u32),
    ) -> Self {
        let (rel_x1, rel_y1, rel_x2, rel_y2) = (clamp01(x1), clamp01(y1), clamp01(x2), clamp01(y2));
        let (w, h) = (resolution.0 as f32, resolution.1 as f32);
        let abs_x1 = (rel_x1 * w).round() as u32;
        let abs_y1 = (rel_y1 * h).round() as u32;
        let abs_x2 = (rel_x2 * w).round() as u32;
        let abs_y2 = (rel_y2 * h).round() as u32;
        DetectedObject {
            label: label.to_string(),
            confidence,
            rel_x1,
            rel_y1,
            rel_x2,
            rel_y2,
            abs_x1,
            abs_y1,
            abs_x2,
            abs_y2,
            rel_width: rel_x2 - rel_x1,
            rel_height: rel_y2 - rel_y1,
            abs_width: abs_x2.saturating_sub(abs_x1),
            abs_height: abs_y2.saturating_sub(abs_y1),
            trigger_event_recording: false,
            store: false,
            relevant: false,
        }
    }

    pub fn from_absolute(
        label: &str,
        confidence: f32,
        (x1, y1, x2, y2): (u32, u32, u32, u32),
        resolution: (u32, u32),
    ) -> Self {
        let (w, h) = (resolution.0 as f32, resolution.1 as f32);
        Self::from_relative(
            label,
            confidence,
            (
                x1 as f32 / w,
                y1 as f32 / h,
                x2 as f32 / w,
                y2 as f32 / h,
            ),
            resolution,
        )
    }

    /// Relative midpoint of the bottom edge, used for zone membership tests.
    pub fn rel_bottom_center(&self) -> (f32, f32) {
        ((self.rel_x1 + self.rel_x2) / 2.0, self.rel_y2)
    }
}

/// Motion polygons for one frame, in absolute and relative coordinates, with
/// the largest relative area precomputed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Contours {
    pub abs_contours: Vec<Vec<Point>>,
    pub rel_contours: Vec<Vec<(f32, f32)>>,
    pub max_area: f32,
}

/// Area of a relative polygon by the shoelace formula.
fn polygon_area(points: &[(f32, f32)]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0f32;
    for i in 0..points.len() {
        let (x1, y1) = points[i];
        let (x2, y2) = points[(i + 1) % points.len()];
        sum += x1 * y2 - x2 * y1;
    }
    (sum / 2.0).abs()
}

impl Contours {
    pub fn empty() -> Self {
        Contours::default()
    }

    pub fn from_absolute(abs_contours: Vec<Vec<Point>>, resolution: (u32, u32)) -> Self {
        let (w, h) = (resolution.0 as f32, resolution.1 as f32);
        let rel_contours: Vec<Vec<(f32, f32)>> = abs_contours
            .iter()
            .map(|poly| {
                poly.iter()
                    .map(|p| (p.x as f32 / w, p.y as f32 / h))
                    .collect()
            })
            .collect();
        let max_area = rel_contours
            .iter()
            .map(|poly| polygon_area(poly))
            .fold(0.0, f32::max);
        Contours {
            abs_contours,
            rel_contours,
            max_area,
        }
    }
}

/// Even-odd ray-cast test on a relative polygon.
pub fn point_in_polygon((px, py): (f32, f32), polygon: &[(f32, f32)]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if ((yi > py) != (yj > py)) && (px < (xj - xi) * (py - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Runtime form of a configured object label filter.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelFilter {
    pub confidence: f32,
    pub height_min: f32,
    pub height_max: f32,
    pub width_min: f32,
    pub width_max: f32,
    pub trigger_event_recording: bool,
    pub store: bool,
    /// Minimum seconds between stored snapshots of this label.
    pub store_interval: u32,
    pub require_motion: bool,
}

impl Default for LabelFilter {
    fn default() -> Self {
        LabelFilter {
            confidence: 0.8,
            height_min: 0.0,
            height_max: 1.0,
            width_min: 0.0,
            width_max: 1.0,
            trigger_event_recording: true,
            store: true,
            store_interval: 60,
            require_motion: false,
        }
    }
}

impl LabelFilter {
    /// Confidence and size window check.
    pub fn passes(&self, obj: &DetectedObject) -> bool {
        obj.confidence >= self.confidence
            && obj.rel_height >= self.height_min
            && obj.rel_height <= self.height_max
            && obj.rel_width >= self.width_min
            && obj.rel_width <= self.width_max
    }
}

/// Rolled-up activity of one camera pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    ScanningForMotion,
    ScanningForObjects,
    Recording,
    ErrorScanningFrame,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Idle => "idle",
            OperationState::ScanningForMotion => "scanning_for_motion",
            OperationState::ScanningForObjects => "scanning_for_objects",
            OperationState::Recording => "recording",
            OperationState::ErrorScanningFrame => "error_scanning_frame",
        }
    }
}

/// Decoded RGB copy of a frame plus the detection state that accompanied it,
/// published for UI streams.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub camera: CameraId,
    pub rgb: Arc<Vec<u8>>,
    pub resolution: (u32, u32),
    pub objects: Option<Vec<DetectedObject>>,
    pub contours: Option<Contours>,
    pub capture_time: DateTime<Utc>,
}

/// Payloads carried on data topics. Tagged variants per topic family.
#[derive(Debug, Clone)]
pub enum DataPayload {
    /// `frame_bytes/<camera>` and `scanner/<camera>/<kind>/scan`.
    Frame(SharedFrame),
    /// `scanner/<camera>/motion/result`.
    MotionResult(Arc<Contours>),
    /// `scanner/<camera>/object/result`.
    ObjectResult(Arc<Vec<DetectedObject>>),
    /// `processed_frame/<camera>`.
    ProcessedFrame(Arc<ProcessedFrame>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_size_is_twelve_bits_per_pixel() {
        assert_eq!(PixelFormat::Nv12.frame_bytes_size(1920, 1080), 3_110_400);
        assert_eq!(PixelFormat::Yuv420p.frame_bytes_size(640, 480), 460_800);
    }

    #[test]
    fn detected_object_round_trips_coordinates() {
        let obj =
            DetectedObject::from_absolute("person", 0.9, (100, 200, 300, 600), (1000, 1000));
        assert!((obj.rel_x1 - 0.1).abs() < 1e-6);
        assert!((obj.rel_y2 - 0.6).abs() < 1e-6);
        assert_eq!(obj.abs_width, 200);
        assert_eq!(obj.abs_height, 400);
        assert!(!obj.trigger_event_recording);
        assert!(!obj.relevant);
    }

    #[test]
    fn contours_max_area() {
        // A quarter-frame square.
        let poly = vec![
            Point { x: 0, y: 0 },
            Point { x: 50, y: 0 },
            Point { x: 50, y: 50 },
            Point { x: 0, y: 50 },
        ];
        let contours = Contours::from_absolute(vec![poly], (100, 100));
        assert!((contours.max_area - 0.25).abs() < 1e-6);
        assert_eq!(Contours::empty().max_area, 0.0);
    }

    #[test]
    fn label_filter_size_window() {
        let filter = LabelFilter {
            confidence: 0.5,
            height_min: 0.1,
            height_max: 0.9,
            ..LabelFilter::default()
        };
        let tall =
            DetectedObject::from_relative("person", 0.8, (0.0, 0.0, 0.5, 0.95), (100, 100));
        assert!(!filter.passes(&tall));
        let ok = DetectedObject::from_relative("person", 0.8, (0.0, 0.0, 0.5, 0.5), (100, 100));
        assert!(filter.passes(&ok));
        let unsure = DetectedObject::from_relative("person", 0.3, (0.0, 0.0, 0.5, 0.5), (100, 100));
        assert!(!filter.passes(&unsure));
    }

    #[test]
    fn point_in_polygon_triangle() {
        let triangle = vec![(0.0, 0.0), (1.0, 0.0), (0.5, 1.0)];
        assert!(point_in_polygon((0.5, 0.5), &triangle));
        assert!(!point_in_polygon((0.05, 0.9), &triangle));
    }
}
