//! Configuration file handling.
//!
//! The file is a YAML mapping of component name to settings. Unknown
//! top-level keys are preserved as raw YAML so collaborator components
//! (webserver, mqtt, webhook) can consume their own sections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use argus_types::{LabelFilter, Point};
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cameras: HashMap<String, CameraConfig>,
    #[serde(default)]
    pub motion_detector: Option<MotionDetectorConfig>,
    #[serde(default)]
    pub object_detector: Option<ObjectDetectorConfig>,
    #[serde(default)]
    pub nvr: Option<NvrConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sections owned by collaborator components (webserver, mqtt, ...).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

/// Read and parse a configuration file, expanding `~` in the path.
pub fn parse_config_file(path: &Path) -> Result<Config, ConfigError> {
    let expanded = shellexpand::tilde(&path.display().to_string()).to_string();
    let path = PathBuf::from(expanded);
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
}

// Camera settings.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Rtsp,
    Rtmp,
    Mjpeg,
}

impl StreamFormat {
    pub fn protocol(&self) -> &'static str {
        match self {
            StreamFormat::Rtsp => "rtsp",
            StreamFormat::Rtmp => "rtmp",
            StreamFormat::Mjpeg => "http",
        }
    }

    /// FFmpeg input timeout option for this transport, microseconds value.
    pub fn timeout_args(&self) -> Vec<String> {
        match self {
            StreamFormat::Rtsp => vec!["-timeout".into(), "5000000".into()],
            StreamFormat::Rtmp | StreamFormat::Mjpeg => {
                vec!["-rw_timeout".into(), "5000000".into()]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigPixelFormat {
    Nv12,
    Yuv420p,
}

impl From<ConfigPixelFormat> for argus_types::PixelFormat {
    fn from(value: ConfigPixelFormat) -> Self {
        match value {
            ConfigPixelFormat::Nv12 => argus_types::PixelFormat::Nv12,
            ConfigPixelFormat::Yuv420p => argus_types::PixelFormat::Yuv420p,
        }
    }
}

/// Options shared between the main stream and an optional substream.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub path: String,
    pub port: u16,
    #[serde(default = "default_stream_format")]
    pub stream_format: StreamFormat,
    /// Protocol override; derived from `stream_format` when unset.
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f32>,
    #[serde(default)]
    pub input_args: Option<Vec<String>>,
    #[serde(default)]
    pub hwaccel_args: Vec<String>,
    #[serde(default)]
    pub codec: Option<String>,
    /// `None` copies source audio when present; `"none"` disables audio.
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
    #[serde(default)]
    pub video_filters: Vec<String>,
    #[serde(default = "default_pix_fmt")]
    pub pix_fmt: ConfigPixelFormat,
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub host: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub global_args: Vec<String>,
    #[serde(flatten)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub substream: Option<StreamConfig>,
    #[serde(default)]
    pub recorder: RecorderConfig,
    /// Skip frame decoding; only supervise the segment writer.
    #[serde(default)]
    pub record_only: bool,
    /// Full decoder command line override.
    #[serde(default)]
    pub raw_command: Option<String>,
    #[serde(default = "default_ffmpeg_loglevel")]
    pub ffmpeg_loglevel: String,
    #[serde(default = "default_ffprobe_loglevel")]
    pub ffprobe_loglevel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Seconds of pre-event footage included in recordings.
    #[serde(default = "default_lookback")]
    pub lookback: f64,
    /// Seconds without a trigger before a recording ends.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,
    #[serde(default)]
    pub hwaccel_args: Vec<String>,
    #[serde(default = "default_recorder_codec")]
    pub codec: String,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub video_filters: Vec<String>,
    #[serde(default)]
    pub audio_filters: Vec<String>,
    #[serde(default)]
    pub output_args: Vec<String>,
    #[serde(default = "default_segments_folder")]
    pub segments_folder: String,
    #[serde(default = "default_recordings_folder")]
    pub recordings_folder: String,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_ffmpeg_loglevel")]
    pub ffmpeg_loglevel: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty recorder config")
    }
}

// Scanner settings.

#[derive(Debug, Clone, Deserialize)]
pub struct MaskConfig {
    pub coordinates: Vec<Point>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MotionDetectorConfig {
    #[serde(default)]
    pub cameras: HashMap<String, MotionScannerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionScannerConfig {
    #[serde(default = "default_motion_fps")]
    pub fps: f32,
    /// Relative contour area that counts as motion.
    #[serde(default = "default_motion_area")]
    pub area: f32,
    /// Whether detected motion alone starts the recorder.
    #[serde(default)]
    pub trigger_event_recording: bool,
    /// Whether ongoing motion keeps a recording alive.
    #[serde(default = "default_true")]
    pub recorder_keepalive: bool,
    /// Seconds motion may keep a recording alive; 0 means no cap.
    #[serde(default = "default_max_recorder_keepalive")]
    pub max_recorder_keepalive: u32,
    #[serde(default)]
    pub mask: Vec<MaskConfig>,
}

impl Default for MotionScannerConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty motion scanner config")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ObjectDetectorConfig {
    #[serde(default)]
    pub cameras: HashMap<String, ObjectScannerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectScannerConfig {
    #[serde(default = "default_object_fps")]
    pub fps: f32,
    /// Only scan for objects while motion is detected.
    #[serde(default = "default_true")]
    pub scan_on_motion_only: bool,
    /// Frames older than this many seconds are not scanned.
    #[serde(default = "default_max_frame_age")]
    pub max_frame_age: f64,
    #[serde(default)]
    pub log_all_objects: bool,
    #[serde(default)]
    pub labels: Vec<LabelConfig>,
    #[serde(default)]
    pub mask: Vec<MaskConfig>,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

impl Default for ObjectScannerConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty object scanner config")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelConfig {
    pub label: String,
    #[serde(default = "default_label_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub height_min: f32,
    #[serde(default = "default_one")]
    pub height_max: f32,
    #[serde(default)]
    pub width_min: f32,
    #[serde(default = "default_one")]
    pub width_max: f32,
    #[serde(default = "default_true")]
    pub trigger_event_recording: bool,
    #[serde(default = "default_true")]
    pub store: bool,
    #[serde(default = "default_store_interval")]
    pub store_interval: u32,
    #[serde(default)]
    pub require_motion: bool,
}

impl LabelConfig {
    pub fn to_filter(&self) -> LabelFilter {
        LabelFilter {
            confidence: self.confidence,
            height_min: self.height_min,
            height_max: self.height_max,
            width_min: self.width_min,
            width_max: self.width_max,
            trigger_event_recording: self.trigger_event_recording,
            store: self.store,
            store_interval: self.store_interval,
            require_motion: self.require_motion,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    pub coordinates: Vec<Point>,
    #[serde(default)]
    pub labels: Vec<LabelConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NvrConfig {
    #[serde(default)]
    pub cameras: Vec<String>,
}

// Storage settings.

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_storage_workers")]
    pub workers: usize,
    /// Percent CPU granted to the storage worker subprocess.
    #[serde(default)]
    pub cpulimit: Option<u32>,
    /// Seconds between tier checks per camera and tier.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty storage config")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub path: String,
    /// Budgets applied to continuous segment files.
    #[serde(default)]
    pub continuous: Option<TierBudget>,
    /// Budgets applied to whole event recordings.
    #[serde(default)]
    pub events: Option<TierBudget>,
    /// Seconds between accepted checks; calls inside the window return
    /// empty.
    #[serde(default = "default_throttle_period")]
    pub throttle_period: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TierBudget {
    #[serde(default)]
    pub max_bytes: u64,
    #[serde(default)]
    pub min_bytes: u64,
    #[serde(default)]
    pub max_age: Option<u64>,
    #[serde(default)]
    pub min_age: Option<u64>,
}

fn default_stream_format() -> StreamFormat {
    StreamFormat::Rtsp
}
fn default_rtsp_transport() -> String {
    "tcp".to_string()
}
fn default_pix_fmt() -> ConfigPixelFormat {
    ConfigPixelFormat::Nv12
}
fn default_frame_timeout() -> u64 {
    60
}
fn default_lookback() -> f64 {
    5.0
}
fn default_idle_timeout() -> f64 {
    10.0
}
fn default_recorder_codec() -> String {
    "copy".to_string()
}
fn default_segments_folder() -> String {
    "/segments".to_string()
}
fn default_recordings_folder() -> String {
    "/recordings".to_string()
}
fn default_extension() -> String {
    "mp4".to_string()
}
fn default_ffmpeg_loglevel() -> String {
    "error".to_string()
}
fn default_ffprobe_loglevel() -> String {
    "error".to_string()
}
fn default_motion_fps() -> f32 {
    1.0
}
fn default_motion_area() -> f32 {
    0.08
}
fn default_max_recorder_keepalive() -> u32 {
    30
}
fn default_object_fps() -> f32 {
    1.0
}
fn default_max_frame_age() -> f64 {
    2.0
}
fn default_label_confidence() -> f32 {
    0.8
}
fn default_one() -> f32 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_store_interval() -> u32 {
    60
}
fn default_database_path() -> String {
    "/config/argus.db".to_string()
}
fn default_storage_workers() -> usize {
    4
}
fn default_check_interval() -> u64 {
    60
}
fn default_throttle_period() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
cameras:
  cam_1:
    host: 192.168.1.10
    port: 554
    path: /stream
    username: admin
    password: secret
    fps: 10
    substream:
      port: 554
      path: /substream
      width: 640
      height: 360
motion_detector:
  cameras:
    cam_1:
      fps: 2
      area: 0.1
object_detector:
  cameras:
    cam_1:
      fps: 1
      labels:
        - label: person
          confidence: 0.7
          require_motion: true
      zones:
        - name: driveway
          coordinates:
            - x: 0
              y: 0
            - x: 100
              y: 0
            - x: 100
              y: 100
nvr:
  cameras: [cam_1]
storage:
  database_path: /tmp/argus.db
  tiers:
    - path: /tier1
      continuous:
        max_bytes: 1000000
webserver:
  port: 8888
"#;

    #[test]
    fn parses_full_example() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        let camera = &config.cameras["cam_1"];
        assert_eq!(camera.host, "192.168.1.10");
        assert_eq!(camera.stream.fps, Some(10.0));
        assert_eq!(camera.stream.frame_timeout, 60);
        assert_eq!(camera.recorder.lookback, 5.0);
        assert_eq!(camera.substream.as_ref().unwrap().width, Some(640));

        let motion = &config.motion_detector.as_ref().unwrap().cameras["cam_1"];
        assert_eq!(motion.fps, 2.0);
        assert!((motion.area - 0.1).abs() < 1e-6);
        assert!(motion.recorder_keepalive);

        let object = &config.object_detector.as_ref().unwrap().cameras["cam_1"];
        assert!(object.scan_on_motion_only);
        let person = &object.labels[0];
        assert!(person.require_motion);
        assert!(person.trigger_event_recording);
        let filter = person.to_filter();
        assert_eq!(filter.confidence, 0.7);

        assert_eq!(config.nvr.as_ref().unwrap().cameras, vec!["cam_1"]);
        assert_eq!(config.storage.tiers.len(), 1);
        assert!(config.extra.contains_key("webserver"));
    }

    #[test]
    fn parse_config_file_reports_io_and_parse_errors() {
        let missing = parse_config_file(Path::new("/nonexistent/argus.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"cameras: [not, a, map]").unwrap();
        let bad = parse_config_file(file.path());
        assert!(matches!(bad, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn defaults_apply_for_minimal_camera() {
        let yaml = r#"
cameras:
  cam_1:
    host: example.com
    port: 554
    path: /s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let camera = &config.cameras["cam_1"];
        assert_eq!(camera.stream.rtsp_transport, "tcp");
        assert!(matches!(camera.stream.pix_fmt, ConfigPixelFormat::Nv12));
        assert!(!camera.record_only);
        assert_eq!(camera.recorder.idle_timeout, 10.0);
        assert_eq!(config.storage.workers, 4);
    }
}
