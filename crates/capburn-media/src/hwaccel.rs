//! Hardware encoder selection.
//!
//! An encoder counts as available when FFmpeg lists it and a tiny test
//! encode with the same arguments the renderer uses succeeds. The result is
//! cached per FFmpeg binary for the life of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};

use tokio::process::Command;
use tracing::{debug, info};

use capburn_models::{EncodingConfig, HwAccel, Quality};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Source used for verification encodes.
const TEST_SOURCE: &str = "color=c=black:s=256x256:r=30:d=0.1";

/// Upper bound for one verification encode.
const VERIFY_TIMEOUT_SECS: u64 = 30;

fn selection_cache() -> &'static Mutex<HashMap<(PathBuf, Vec<HwAccel>), HwAccel>> {
    static CACHE: OnceLock<Mutex<HashMap<(PathBuf, Vec<HwAccel>), HwAccel>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Encoder names listed by `ffmpeg -encoders`.
pub fn parse_encoder_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            // Encoder rows start with a six-character capability column
            (flags.len() == 6 && flags.starts_with('V') && name != "=").then(|| name.to_string())
        })
        .collect()
}

/// First entry of `preference` whose encoder is in `available`.
pub fn choose(preference: &[HwAccel], available: &[String]) -> HwAccel {
    preference
        .iter()
        .copied()
        .filter(HwAccel::is_hardware)
        .find(|hw| available.iter().any(|name| name == hw.h264_encoder()))
        .unwrap_or(HwAccel::None)
}

/// List the video encoders compiled into `ffmpeg`.
pub async fn probe_encoders(ffmpeg: &Path) -> MediaResult<Vec<String>> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| MediaError::FfmpegNotFound(format!("{}: {}", ffmpeg.display(), e)))?;

    Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Run a short test encode with `hw`. Listed encoders often fail at
/// runtime when the device or driver is missing.
///
/// The encode goes through `runner`, so it is tracked and killed like any
/// other job process. Only cancellation is an error.
pub async fn verify_encoder(runner: &FfmpegRunner, hw: HwAccel) -> MediaResult<bool> {
    let config = EncodingConfig::for_quality(Quality::Low).with_hw_accel(hw);
    let cmd = FfmpegCommand::new(TEST_SOURCE, "-")
        .input_args(["-f", "lavfi"])
        .output_args(config.video_args())
        .output_args(["-frames:v", "1", "-f", "null"]);

    match runner.clone().with_timeout(VERIFY_TIMEOUT_SECS).run(&cmd).await {
        Ok(()) => Ok(true),
        Err(MediaError::Cancelled) => Err(MediaError::Cancelled),
        Err(e) => {
            debug!(encoder = hw.h264_encoder(), "Hardware encoder failed verification: {}", e);
            Ok(false)
        }
    }
}

/// Select the first listed and working encoder from `preference`, or
/// software when none qualifies. Probe errors select software; the only
/// error is cancellation, which leaves the cache untouched.
pub async fn select_hw_accel(runner: &FfmpegRunner, preference: &[HwAccel]) -> MediaResult<HwAccel> {
    let ffmpeg = runner.binary();
    let key = (ffmpeg.to_path_buf(), preference.to_vec());
    if let Some(hw) = selection_cache()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&key)
    {
        return Ok(*hw);
    }

    let available = match probe_encoders(ffmpeg).await {
        Ok(list) => list,
        Err(e) => {
            debug!("Encoder probe failed, using software: {}", e);
            Vec::new()
        }
    };

    let mut selected = HwAccel::None;
    for hw in preference.iter().copied().filter(HwAccel::is_hardware) {
        if choose(&[hw], &available) == HwAccel::None {
            continue;
        }
        if verify_encoder(runner, hw).await? {
            selected = hw;
            break;
        }
    }

    info!(selected = %selected, encoder = selected.h264_encoder(), "Selected video encoder");
    selection_cache()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key, selected);
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS: &str = "\
Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn test_parse_encoder_list() {
        let encoders = parse_encoder_list(ENCODERS);
        assert!(encoders.contains(&"libx264".to_string()));
        assert!(encoders.contains(&"h264_nvenc".to_string()));
        assert!(!encoders.contains(&"aac".to_string()));
        assert!(!encoders.contains(&"=".to_string()));
    }

    #[test]
    fn test_choose_respects_preference_order() {
        let encoders = parse_encoder_list(ENCODERS);
        assert_eq!(choose(&[HwAccel::Vaapi, HwAccel::Nvenc], &encoders), HwAccel::Vaapi);
        assert_eq!(choose(&[HwAccel::Qsv, HwAccel::Nvenc], &encoders), HwAccel::Nvenc);
        assert_eq!(choose(&[HwAccel::Qsv, HwAccel::Amf], &encoders), HwAccel::None);
        assert_eq!(choose(&[], &encoders), HwAccel::None);
    }

    #[tokio::test]
    async fn test_missing_binary_selects_software() {
        let runner = FfmpegRunner::new().with_binary("/nonexistent/ffmpeg");
        let hw = select_hw_accel(&runner, &[HwAccel::Nvenc]).await.unwrap();
        assert_eq!(hw, HwAccel::None);
    }

    #[test]
    fn test_verification_command_targets_null_muxer() {
        let config = EncodingConfig::for_quality(Quality::Low).with_hw_accel(HwAccel::Nvenc);
        let args = FfmpegCommand::new(TEST_SOURCE, "-")
            .input_args(["-f", "lavfi"])
            .output_args(config.video_args())
            .output_args(["-frames:v", "1", "-f", "null"])
            .build_args();
        let input = args.iter().position(|a| a == TEST_SOURCE).unwrap();
        assert_eq!(&args[input - 3..input], ["-f", "lavfi", "-i"]);
        assert!(args.contains(&"h264_nvenc".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    /// A stand-in ffmpeg that lists NVENC and hangs on any encode.
    #[cfg(unix)]
    fn hanging_ffmpeg(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             case \"$*\" in *-encoders*) echo ' V....D h264_nvenc  NVIDIA NVENC'; exit 0;; esac\n\
             exec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_interrupts_verification() {
        use std::sync::Arc;
        use std::time::Duration;

        use crate::job::{CancelHandle, ProcessRegistry};

        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = hanging_ffmpeg(dir.path());
        let cancel = CancelHandle::new();
        let registry = Arc::new(ProcessRegistry::new());
        let runner = FfmpegRunner::new()
            .with_binary(&ffmpeg)
            .with_cancel(cancel.subscribe())
            .with_registry(Arc::clone(&registry));

        let trigger = {
            let cancel = cancel.clone();
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while registry.active_count() == 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                cancel.cancel();
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            select_hw_accel(&runner, &[HwAccel::Nvenc]),
        )
        .await
        .expect("selection ignored cancellation");
        trigger.abort();

        assert!(matches!(result, Err(MediaError::Cancelled)));
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.spawned_count(), 1);
        let key = (ffmpeg, vec![HwAccel::Nvenc]);
        assert!(!selection_cache().lock().unwrap().contains_key(&key));
    }
}
