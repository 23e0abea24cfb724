//! FFprobe video information.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::command::check_ffprobe;
use crate::error::{MediaError, MediaResult};

/// Video file information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// Duration in seconds
    pub duration: f64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frame rate (fps)
    pub fps: f64,
    /// Video codec
    pub codec: String,
    /// Whether an audio stream is present
    pub has_audio: bool,
    /// Codec of the first audio stream
    pub audio_codec: Option<String>,
}

impl VideoInfo {
    /// Whether stream-copied slices can be concatenated with re-encoded ones.
    pub fn is_copy_compatible(&self) -> bool {
        self.codec == "h264" && self.audio_codec.as_deref().map_or(true, |c| c == "aac")
    }

    /// Duration of one frame in seconds.
    pub fn frame_secs(&self) -> f64 {
        if self.fps > 0.0 {
            1.0 / self.fps
        } else {
            1.0 / 30.0
        }
    }
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

/// Probe a video file for information using the `ffprobe` on `PATH`.
pub async fn probe_video(path: impl AsRef<Path>) -> MediaResult<VideoInfo> {
    probe_video_with(Path::new("ffprobe"), path).await
}

/// Probe a video file with a specific ffprobe binary.
pub async fn probe_video_with(ffprobe: &Path, path: impl AsRef<Path>) -> MediaResult<VideoInfo> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(MediaError::invalid_input(format!(
            "Source video does not exist: {}",
            path.display()
        )));
    }

    check_ffprobe(ffprobe)?;

    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: format!("FFprobe failed on {}", path.display()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
        });
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(json: &[u8]) -> MediaResult<VideoInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(json)?;

    let video_stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| MediaError::invalid_input("No video stream found"))?;

    let audio_stream = probe.streams.iter().find(|s| s.codec_type == "audio");

    // Container duration first, stream duration as fallback
    let duration = probe
        .format
        .duration
        .as_deref()
        .or(video_stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let fps = video_stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video_stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(30.0);

    Ok(VideoInfo {
        duration,
        width: video_stream.width.unwrap_or(0),
        height: video_stream.height.unwrap_or(0),
        fps,
        codec: video_stream.codec_name.clone().unwrap_or_default(),
        has_audio: audio_stream.is_some(),
        audio_codec: audio_stream.and_then(|s| s.codec_name.clone()),
    })
}

#[derive(Debug, Deserialize)]
struct KeyframeOutput {
    #[serde(default)]
    packets: Vec<KeyframePacket>,
    format: Option<KeyframeFormat>,
}

#[derive(Debug, Deserialize)]
struct KeyframePacket {
    pts_time: Option<String>,
    flags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyframeFormat {
    start_time: Option<String>,
}

/// Keyframe times of the first video stream, in seconds from the start of
/// the file and in ascending order.
///
/// Reads packet flags only, so nothing is decoded.
pub async fn list_keyframes(ffprobe: &Path, path: impl AsRef<Path>) -> MediaResult<Vec<f64>> {
    let path = path.as_ref();
    check_ffprobe(ffprobe)?;

    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "packet=pts_time,flags:format=start_time",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: format!("Keyframe listing failed on {}", path.display()),
            stderr: Some(String::from_utf8_lossy(&output.stderr).to_string()),
        });
    }

    parse_keyframes(&output.stdout)
}

fn parse_keyframes(json: &[u8]) -> MediaResult<Vec<f64>> {
    let listing: KeyframeOutput = serde_json::from_slice(json)?;
    let origin = listing
        .format
        .and_then(|f| f.start_time)
        .and_then(|t| t.parse::<f64>().ok())
        .unwrap_or(0.0);

    let mut keyframes: Vec<f64> = listing
        .packets
        .iter()
        .filter(|p| p.flags.as_deref().is_some_and(|f| f.starts_with('K')))
        .filter_map(|p| p.pts_time.as_deref()?.parse::<f64>().ok())
        .map(|t| (t - origin).max(0.0))
        .collect();
    keyframes.sort_by(f64::total_cmp);
    keyframes.dedup();
    Ok(keyframes)
}

/// Parse frame rate string (e.g., "30/1" or "29.97"). Zero rates are rejected.
fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den <= 0.0 {
            return None;
        }
        num / den
    } else {
        s.parse().ok()?
    };
    (rate > 0.0).then_some(rate)
}
