//! Segment discovery, concat script generation and the concat subprocess.
//!
//! Segment files are named `%Y%m%d%H%M%S.<ext>` by the camera's segmenter;
//! the name gives the start time and ffprobe gives the duration. A segment
//! that is still being written reports no moov atom yet, so probing retries
//! for a little over one segment length before giving up on a file.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, error, warn};

pub use argus_types::{format_segment_stem, parse_segment_stem};

use crate::{ConcatError, SEGMENT_DURATION_SECS};

/// Duration lookup for one segment file. Trait so tests can avoid spawning
/// ffprobe.
pub trait DurationProber: Send + Sync {
    fn probe_duration(&self, path: &Path) -> Option<f64>;
}

pub struct FfprobeDurationProber {
    pub loglevel: String,
}

impl Default for FfprobeDurationProber {
    fn default() -> Self {
        FfprobeDurationProber {
            loglevel: "error".to_string(),
        }
    }
}

impl DurationProber for FfprobeDurationProber {
    fn probe_duration(&self, path: &Path) -> Option<f64> {
        let mut tries: i64 = 0;
        loop {
            let output = Command::new("ffprobe")
                .args([
                    "-hide_banner",
                    "-loglevel",
                    &self.loglevel,
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                ])
                .arg(path)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output();
            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    error!("could not run ffprobe on {}: {e}", path.display());
                    return None;
                }
            };
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if output.status.success() {
                if let Ok(duration) = stdout.parse::<f64>() {
                    return Some(duration);
                }
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let locked = stderr.contains("moov atom not found") || stdout == "N/A";
            if locked && tries <= SEGMENT_DURATION_SECS + 5 {
                debug!("{} is locked, trying again in 1 second", path.display());
                tries += 1;
                std::thread::sleep(std::time::Duration::from_secs(1));
                continue;
            }
            error!(
                "could not get duration for {}: {}",
                path.display(),
                stderr.trim()
            );
            return None;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub file_name: String,
    /// Unix seconds parsed from the file name.
    pub start: i64,
    pub duration: f64,
}

impl Segment {
    pub fn end(&self) -> f64 {
        self.start as f64 + self.duration
    }
}

/// All probeable segments in a directory, sorted by start time.
pub fn list_segments(directory: &Path, prober: &dyn DurationProber) -> Vec<Segment> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            error!("could not list segments in {}: {e}", directory.display());
            return Vec::new();
        }
    };
    let mut segments = Vec::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(start) = parse_segment_stem(&file_name) else {
            warn!("could not extract timestamp from segment {file_name}");
            continue;
        };
        let Some(duration) = prober.probe_duration(&entry.path()) else {
            continue;
        };
        segments.push(Segment {
            file_name,
            start,
            duration,
        });
    }
    segments.sort_by_key(|s| s.start);
    segments
}

/// First segment whose span includes `timestamp`.
pub fn find_segment(segments: &[Segment], timestamp: f64) -> Option<usize> {
    segments
        .iter()
        .position(|s| s.start as f64 <= timestamp && timestamp <= s.end())
}

/// Inclusive index range of segments to concatenate for an event window.
/// Falls back to the earliest segment when no segment brackets the start and
/// to the latest when none brackets the end.
pub fn concat_window(segments: &[Segment], event_start: f64, event_end: f64) -> Option<(usize, usize)> {
    if segments.is_empty() {
        return None;
    }
    let first = find_segment(segments, event_start).unwrap_or_else(|| {
        warn!("could not find matching start segment, using earliest possible");
        0
    });
    let last = find_segment(segments, event_end).unwrap_or_else(|| {
        warn!("could not find matching end segment, using latest possible");
        segments.len() - 1
    });
    if first > last {
        return None;
    }
    Some((first, last))
}

/// Concat demuxer script for the given segments. `inpoint` appears after the
/// first file only when the event starts strictly inside it; `outpoint`
/// after the last only when the event ends strictly inside it.
pub fn generate_concat_script(
    directory: &Path,
    segments: &[Segment],
    event_start: f64,
    event_end: f64,
) -> String {
    let mut script = String::new();
    for (i, segment) in segments.iter().enumerate() {
        let path = directory.join(&segment.file_name);
        script.push_str(&format!("file 'file:{}'\n", path.display()));
        if i == 0 && event_start > segment.start as f64 {
            script.push_str(&format!("inpoint {}\n", (event_start - segment.start as f64) as i64));
        }
        if i == segments.len() - 1 && event_end < segment.end() {
            script.push_str(&format!("outpoint {}\n", (event_end - segment.start as f64) as i64));
        }
    }
    script
}

/// FFmpeg arguments applied to the concat output.
#[derive(Debug, Clone)]
pub struct ConcatSettings {
    pub hwaccel_args: Vec<String>,
    pub codec: String,
    /// `None` copies source audio.
    pub audio_codec: Option<String>,
    pub video_filters: Vec<String>,
    pub audio_filters: Vec<String>,
    pub output_args: Vec<String>,
    pub loglevel: String,
}

impl Default for ConcatSettings {
    fn default() -> Self {
        ConcatSettings {
            hwaccel_args: Vec::new(),
            codec: "copy".to_string(),
            audio_codec: None,
            video_filters: Vec::new(),
            audio_filters: Vec::new(),
            output_args: Vec::new(),
            loglevel: "error".to_string(),
        }
    }
}

/// Runs a concat script to a file. Trait so recorder tests can avoid
/// spawning ffmpeg.
pub trait ConcatRunner: Send + Sync {
    fn run(&self, script: &str, output: &Path) -> Result<(), ConcatError>;
}

pub struct FfmpegConcat {
    pub settings: ConcatSettings,
}

impl ConcatRunner for FfmpegConcat {
    fn run(&self, script: &str, output: &Path) -> Result<(), ConcatError> {
        let settings = &self.settings;
        let mut command = Command::new("ffmpeg");
        command.args(["-hide_banner", "-loglevel", &settings.loglevel, "-y"]);
        command.args(&settings.hwaccel_args);
        command.args(["-protocol_whitelist", "file,pipe", "-f", "concat", "-safe", "0", "-i", "-"]);
        command.args(["-c:v", &settings.codec]);
        match &settings.audio_codec {
            Some(codec) => command.args(["-c:a", codec.as_str()]),
            None => command.args(["-c:a", "copy"]),
        };
        if !settings.video_filters.is_empty() {
            command.args(["-filter:v", &settings.video_filters.join(",")]);
        }
        if !settings.audio_filters.is_empty() {
            command.args(["-filter:a", &settings.audio_filters.join(",")]);
        }
        command.args(&settings.output_args);
        command.args(["-movflags", "+faststart"]);
        command.arg(output);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("concat command: {command:?}");
        debug!("segment script:\n{script}");

        let mut child = command.spawn()?;
        {
            let mut stdin = child.stdin.take().expect("piped stdin");
            stdin.write_all(script.as_bytes())?;
        }
        let result = child.wait_with_output()?;
        if result.status.success() {
            Ok(())
        } else {
            Err(ConcatError::ProcessFailed(
                String::from_utf8_lossy(&result.stderr).trim().to_string(),
            ))
        }
    }
}

/// Concatenate the segments covering `[event_start, event_end]` into
/// `destination`. The clip is assembled in a temp file and copied into place
/// so readers never observe a partial file.
pub fn concat_segments(
    directory: &Path,
    prober: &dyn DurationProber,
    runner: &dyn ConcatRunner,
    event_start: f64,
    event_end: f64,
    destination: &Path,
) -> Result<(), ConcatError> {
    let segments = list_segments(directory, prober);
    let Some((first, last)) = concat_window(&segments, event_start, event_end) else {
        return Err(ConcatError::NoSegments(directory.to_path_buf()));
    };
    let script = generate_concat_script(directory, &segments[first..=last], event_start, event_end);

    let file_name = destination
        .file_name()
        .ok_or_else(|| ConcatError::NoSegments(directory.to_path_buf()))?;
    let temp_path = std::env::temp_dir().join(file_name);
    runner.run(&script, &temp_path)?;

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&temp_path, destination)?;
    std::fs::remove_file(&temp_path)?;
    debug!("segments concatenated to {}", destination.display());
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct FakeProber {
        pub durations: HashMap<String, f64>,
    }

    impl DurationProber for FakeProber {
        fn probe_duration(&self, path: &Path) -> Option<f64> {
            let name = path.file_name()?.to_string_lossy().to_string();
            self.durations.get(&name).copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProber;
    use super::*;
    use std::collections::HashMap;

    fn segment(start: i64, duration: f64) -> Segment {
        Segment {
            file_name: format!("{start}.mp4"),
            start,
            duration,
        }
    }

    #[test]
    fn parses_segment_names() {
        let start = parse_segment_stem("20240521101500.mp4").unwrap();
        let formatted = format_segment_stem(chrono::DateTime::from_timestamp(start, 0).unwrap());
        assert_eq!(formatted, "20240521101500");
        assert!(parse_segment_stem("not-a-timestamp.mp4").is_none());
    }

    #[test]
    fn window_with_partial_endpoints() {
        // Segments every 5 s at t = 0, 5, 10, 15; event 7..12.
        let segments: Vec<Segment> = [0, 5, 10, 15].iter().map(|&s| segment(s, 5.0)).collect();
        let (first, last) = concat_window(&segments, 7.0, 12.0).unwrap();
        assert_eq!((first, last), (1, 2));

        let script =
            generate_concat_script(Path::new("/seg"), &segments[first..=last], 7.0, 12.0);
        assert_eq!(
            script,
            "file 'file:/seg/5.mp4'\ninpoint 2\nfile 'file:/seg/10.mp4'\noutpoint 2\n"
        );
    }

    #[test]
    fn window_inside_single_segment_gets_both_points() {
        let segments = vec![segment(0, 5.0)];
        let script = generate_concat_script(Path::new("/seg"), &segments, 1.0, 4.0);
        assert_eq!(script, "file 'file:/seg/0.mp4'\ninpoint 1\noutpoint 4\n");
    }

    #[test]
    fn aligned_window_gets_no_points() {
        let segments: Vec<Segment> = [0, 5].iter().map(|&s| segment(s, 5.0)).collect();
        let script = generate_concat_script(Path::new("/seg"), &segments, 0.0, 10.0);
        assert_eq!(script, "file 'file:/seg/0.mp4'\nfile 'file:/seg/5.mp4'\n");
    }

    #[test]
    fn out_of_range_window_falls_back_to_extremes() {
        let segments: Vec<Segment> = [10, 15].iter().map(|&s| segment(s, 5.0)).collect();
        // Start before the earliest segment, end past the latest.
        let (first, last) = concat_window(&segments, 3.0, 100.0).unwrap();
        assert_eq!((first, last), (0, 1));
        assert!(concat_window(&[], 0.0, 1.0).is_none());
    }

    #[test]
    fn lists_and_finds_segments_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["20240101000000.mp4", "20240101000005.mp4", "garbage.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let mut durations = HashMap::new();
        durations.insert("20240101000000.mp4".to_string(), 5.0);
        durations.insert("20240101000005.mp4".to_string(), 5.0);
        let prober = FakeProber { durations };

        let segments = list_segments(dir.path(), &prober);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].start < segments[1].start);

        let base = segments[0].start as f64;
        assert_eq!(find_segment(&segments, base + 2.0), Some(0));
        assert_eq!(find_segment(&segments, base + 7.0), Some(1));
        assert_eq!(find_segment(&segments, base + 100.0), None);
    }
}
