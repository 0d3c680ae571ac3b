//! Stream probing via ffprobe.
//!
//! Width, height, FPS and codecs are read from the stream when the
//! configuration leaves them unset. Probes are retried with exponential
//! backoff; every timeout also grows the next attempt's own timeout.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, error};

use crate::CameraError;

/// Base ffprobe timeout; grows by this much after every timed-out attempt.
pub const FFPROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Probe attempts before giving up.
pub const FFPROBE_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInformation {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    pub codec: Option<String>,
    pub audio_codec: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
}

fn parse_frame_rate(rate: &str) -> Option<f32> {
    let (numerator, denominator) = rate.split_once('/')?;
    let numerator: f32 = numerator.parse().ok()?;
    let denominator: f32 = denominator.parse().ok()?;
    if denominator == 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

/// Parse ffprobe's `-print_format json` output. Leading non-JSON noise is
/// trimmed away.
pub fn parse_ffprobe_output(raw: &str) -> Result<StreamInformation, CameraError> {
    let start = raw
        .find('{')
        .ok_or_else(|| CameraError::FfprobeOutput(raw.to_string()))?;
    let output: FfprobeOutput = serde_json::from_str(&raw[start..])
        .map_err(|e| CameraError::FfprobeOutput(e.to_string()))?;
    if let Some(error) = output.error {
        return Err(CameraError::FfprobeError(error.to_string()));
    }

    let video = output.streams.iter().find(|s| s.codec_type == "video");
    let audio = output.streams.iter().find(|s| s.codec_type == "audio");

    let mut info = StreamInformation {
        width: None,
        height: None,
        fps: None,
        codec: None,
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
    };
    if let Some(video) = video {
        info.width = video.width;
        info.height = video.height;
        info.codec = video.codec_name.clone();
        info.fps = video.avg_frame_rate.as_deref().and_then(parse_frame_rate);
    }
    Ok(info)
}

fn run_once(
    command: &mut Command,
    command_line: &str,
    timeout: Duration,
) -> Result<String, CameraError> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let started = Instant::now();
    loop {
        match child.try_wait()? {
            Some(_status) => {
                use std::io::Read;
                let mut stdout = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    pipe.read_to_string(&mut stdout)?;
                }
                return Ok(stdout);
            }
            None => {
                if started.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CameraError::FfprobeTimeout {
                        command: command_line.to_string(),
                        timeout,
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Probe a stream URL, retrying timeouts with exponential backoff.
pub fn probe_stream(stream_url: &str, loglevel: &str) -> Result<StreamInformation, CameraError> {
    let args = [
        "-hide_banner",
        "-loglevel",
        loglevel,
        "-print_format",
        "json",
        "-show_error",
        "-show_streams",
        stream_url,
    ];
    let command_line = format!("ffprobe {}", args.join(" "));
    let mut timeout = FFPROBE_TIMEOUT;
    let mut last_error = None;
    for attempt in 1..=FFPROBE_ATTEMPTS {
        let mut command = Command::new("ffprobe");
        command.args(args);
        match run_once(&mut command, &command_line, timeout) {
            Ok(stdout) => return parse_ffprobe_output(&stdout),
            Err(error @ CameraError::FfprobeTimeout { .. }) => {
                error!("ffprobe attempt {attempt}/{FFPROBE_ATTEMPTS} failed: {error}");
                timeout += FFPROBE_TIMEOUT;
                last_error = Some(error);
                let wait = backoff(attempt);
                debug!("retrying ffprobe in {wait:?}");
                std::thread::sleep(wait);
            }
            Err(error) => return Err(error),
        }
    }
    Err(last_error.unwrap_or_else(|| CameraError::FfprobeError("probe failed".to_string())))
}

fn backoff(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).clamp(1, 30);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
{
    "streams": [
        {
            "codec_type": "video",
            "codec_name": "h264",
            "width": 1920,
            "height": 1080,
            "avg_frame_rate": "15/1"
        },
        {
            "codec_type": "audio",
            "codec_name": "aac"
        }
    ]
}
"#;

    #[test]
    fn parses_stream_information() {
        let info = parse_ffprobe_output(SAMPLE).unwrap();
        assert_eq!(info.width, Some(1920));
        assert_eq!(info.height, Some(1080));
        assert_eq!(info.fps, Some(15.0));
        assert_eq!(info.codec.as_deref(), Some("h264"));
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
    }

    #[test]
    fn trims_noise_before_json() {
        let noisy = format!("some banner text\n{SAMPLE}");
        assert!(parse_ffprobe_output(&noisy).is_ok());
    }

    #[test]
    fn reported_error_is_surfaced() {
        let raw = r#"{"error": {"code": -5, "string": "I/O error"}}"#;
        let result = parse_ffprobe_output(raw);
        assert!(matches!(result, Err(CameraError::FfprobeError(_))));
    }

    #[test]
    fn zero_denominator_frame_rate_is_ignored() {
        let raw = r#"{"streams": [{"codec_type": "video", "avg_frame_rate": "0/0"}]}"#;
        let info = parse_ffprobe_output(raw).unwrap();
        assert_eq!(info.fps, None);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(9), Duration::from_secs(30));
    }
}
