//! Video encoding configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default software video codec (H.264)
pub const DEFAULT_VIDEO_CODEC: &str = "libx264";
/// Default audio codec
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
/// Default audio bitrate
pub const DEFAULT_AUDIO_BITRATE: &str = "192k";
/// Pixel format for every encoded output, required for concat compatibility
pub const OUTPUT_PIXEL_FORMAT: &str = "yuv420p";

/// User-facing quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl Quality {
    /// libx264 preset for this tier.
    pub fn x264_preset(&self) -> &'static str {
        match self {
            Quality::Low => "veryfast",
            Quality::Medium => "fast",
            Quality::High => "medium",
            Quality::Ultra => "slow",
        }
    }

    /// Constant Rate Factor for this tier (lower is better).
    pub fn crf(&self) -> u8 {
        match self {
            Quality::Low => 28,
            Quality::Medium => 23,
            Quality::High => 20,
            Quality::Ultra => 17,
        }
    }

    /// NVENC preset (p1 fastest .. p7 best).
    pub fn nvenc_preset(&self) -> &'static str {
        match self {
            Quality::Low => "p2",
            Quality::Medium => "p4",
            Quality::High => "p5",
            Quality::Ultra => "p7",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Ultra => "ultra",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            "ultra" => Ok(Quality::Ultra),
            other => Err(format!("unknown quality tier: {}", other)),
        }
    }
}

/// Hardware encoder backend tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    /// NVIDIA NVENC
    Nvenc,
    /// Apple VideoToolbox
    VideoToolbox,
    /// Intel Quick Sync
    Qsv,
    /// AMD AMF
    Amf,
    /// VA-API (Linux)
    Vaapi,
    /// Software encoding
    #[default]
    None,
}

impl HwAccel {
    /// FFmpeg H.264 encoder name.
    pub fn h264_encoder(&self) -> &'static str {
        match self {
            HwAccel::Nvenc => "h264_nvenc",
            HwAccel::VideoToolbox => "h264_videotoolbox",
            HwAccel::Qsv => "h264_qsv",
            HwAccel::Amf => "h264_amf",
            HwAccel::Vaapi => "h264_vaapi",
            HwAccel::None => DEFAULT_VIDEO_CODEC,
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, HwAccel::None)
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HwAccel::Nvenc => "nvenc",
            HwAccel::VideoToolbox => "videotoolbox",
            HwAccel::Qsv => "qsv",
            HwAccel::Amf => "amf",
            HwAccel::Vaapi => "vaapi",
            HwAccel::None => "none",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for HwAccel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nvenc" | "nvidia" | "cuda" => Ok(HwAccel::Nvenc),
            "videotoolbox" | "vt" => Ok(HwAccel::VideoToolbox),
            "qsv" | "intel" => Ok(HwAccel::Qsv),
            "amf" | "amd" => Ok(HwAccel::Amf),
            "vaapi" => Ok(HwAccel::Vaapi),
            "none" | "software" | "cpu" | "" => Ok(HwAccel::None),
            other => Err(format!("unknown hardware accelerator: {}", other)),
        }
    }
}

/// Video encoding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EncodingConfig {
    /// Encoder backend
    #[serde(default)]
    pub hw_accel: HwAccel,

    /// Quality tier
    #[serde(default)]
    pub quality: Quality,

    /// Output frame rate; `None` keeps the source rate
    #[serde(default)]
    pub framerate: Option<f64>,

    /// Audio codec
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// Audio bitrate
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,

    /// Additional FFmpeg output arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_audio_codec() -> String {
    DEFAULT_AUDIO_CODEC.to_string()
}
fn default_audio_bitrate() -> String {
    DEFAULT_AUDIO_BITRATE.to_string()
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            hw_accel: HwAccel::None,
            quality: Quality::Medium,
            framerate: None,
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            audio_bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl EncodingConfig {
    /// Create a software configuration for a quality tier.
    pub fn for_quality(quality: Quality) -> Self {
        Self {
            quality,
            ..Default::default()
        }
    }

    /// Returns a new config using the given encoder backend.
    pub fn with_hw_accel(mut self, hw_accel: HwAccel) -> Self {
        self.hw_accel = hw_accel;
        self
    }

    /// Returns a new config forced onto software encoding.
    pub fn software(&self) -> Self {
        Self {
            hw_accel: HwAccel::None,
            ..self.clone()
        }
    }

    /// Returns a new config with an output frame rate.
    pub fn with_framerate(mut self, framerate: f64) -> Self {
        self.framerate = Some(framerate);
        self
    }

    /// Video codec arguments (`-c:v` and its rate control).
    pub fn video_args(&self) -> Vec<String> {
        let q = self.quality;
        let mut args = vec!["-c:v".to_string(), self.hw_accel.h264_encoder().to_string()];

        match self.hw_accel {
            HwAccel::None => {
                args.extend([
                    "-preset".to_string(),
                    q.x264_preset().to_string(),
                    "-crf".to_string(),
                    q.crf().to_string(),
                ]);
            }
            // NVENC uses -cq instead of -crf
            HwAccel::Nvenc => {
                args.extend([
                    "-preset".to_string(),
                    q.nvenc_preset().to_string(),
                    "-rc".to_string(),
                    "vbr".to_string(),
                    "-cq".to_string(),
                    q.crf().to_string(),
                ]);
            }
            HwAccel::VideoToolbox => {
                // VideoToolbox quality scale is 1-100, higher is better
                let vt_quality = 100u8.saturating_sub(q.crf() * 2);
                args.extend(["-q:v".to_string(), vt_quality.to_string()]);
            }
            HwAccel::Qsv => {
                args.extend(["-global_quality".to_string(), q.crf().to_string()]);
            }
            HwAccel::Amf => {
                args.extend([
                    "-rc".to_string(),
                    "cqp".to_string(),
                    "-qp_i".to_string(),
                    q.crf().to_string(),
                    "-qp_p".to_string(),
                    q.crf().to_string(),
                ]);
            }
            HwAccel::Vaapi => {
                args.extend(["-qp".to_string(), q.crf().to_string()]);
            }
        }

        if self.hw_accel != HwAccel::Vaapi {
            args.extend(["-pix_fmt".to_string(), OUTPUT_PIXEL_FORMAT.to_string()]);
        }

        if let Some(fps) = self.framerate {
            args.extend(["-r".to_string(), format_framerate(fps)]);
        }

        args
    }

    /// Audio codec arguments.
    pub fn audio_args(&self) -> Vec<String> {
        vec![
            "-c:a".to_string(),
            self.audio_codec.clone(),
            "-b:a".to_string(),
            self.audio_bitrate.clone(),
        ]
    }

    /// Convert to FFmpeg command arguments.
    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        let mut args = self.video_args();
        args.extend(self.audio_args());
        args.extend(self.extra_args.clone());
        args
    }
}

fn format_framerate(fps: f64) -> String {
    if (fps - fps.round()).abs() < 1e-9 {
        format!("{}", fps.round() as u32)
    } else {
        format!("{:.3}", fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EncodingConfig::default();
        let args = config.to_ffmpeg_args();
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"-crf".to_string()));
        assert!(args.contains(&"23".to_string()));
        assert!(args.contains(&"yuv420p".to_string()));
    }

    #[test]
    fn test_quality_tiers_are_ordered() {
        assert!(Quality::Low.crf() > Quality::Medium.crf());
        assert!(Quality::Medium.crf() > Quality::High.crf());
        assert!(Quality::High.crf() > Quality::Ultra.crf());
    }

    #[test]
    fn test_nvenc_config() {
        let config = EncodingConfig::for_quality(Quality::High).with_hw_accel(HwAccel::Nvenc);
        let args = config.to_ffmpeg_args();
        assert!(args.contains(&"h264_nvenc".to_string()));
        assert!(args.contains(&"-cq".to_string())); // NVENC uses -cq instead of -crf
        assert!(!args.contains(&"-crf".to_string()));
    }

    #[test]
    fn test_software_fallback_keeps_quality() {
        let config = EncodingConfig::for_quality(Quality::Ultra).with_hw_accel(HwAccel::Qsv);
        let sw = config.software();
        assert_eq!(sw.hw_accel, HwAccel::None);
        assert_eq!(sw.quality, Quality::Ultra);
    }

    #[test]
    fn test_framerate_args() {
        let args = EncodingConfig::default().with_framerate(30.0).video_args();
        let pos = args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(args[pos + 1], "30");

        let args = EncodingConfig::default().with_framerate(29.97).video_args();
        assert!(args.contains(&"29.970".to_string()));
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!("ULTRA".parse::<Quality>().unwrap(), Quality::Ultra);
        assert_eq!("nvidia".parse::<HwAccel>().unwrap(), HwAccel::Nvenc);
        assert!("bogus".parse::<HwAccel>().is_err());
    }
}
