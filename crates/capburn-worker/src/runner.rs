//! Render job runner.
//!
//! Reads a request file, drives the media pipeline with logged progress and
//! reports plans or hardware selection for the CLI.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use capburn_media::{
    hwaccel, plan_render, render_with_job, select_hw_accel, FfmpegRunner, ProgressFn, RenderJob,
    RenderPlan,
};
use capburn_models::{HwAccel, RenderRequest};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

/// Progress is logged every this many percent.
const PROGRESS_LOG_STEP: u8 = 10;

/// Read and validate a request file.
///
/// `output` replaces the request's output path.
pub async fn load_request(path: &Path, output: Option<&Path>) -> WorkerResult<RenderRequest> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| WorkerError::RequestRead {
            path: path.to_path_buf(),
            source,
        })?;
    let mut request: RenderRequest =
        serde_json::from_str(&raw).map_err(|source| WorkerError::RequestParse {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(output) = output {
        request.output_path = output.to_path_buf();
    }
    Ok(request)
}

/// Progress sink that logs through `logger` in fixed steps.
pub fn logging_progress(logger: JobLogger) -> ProgressFn {
    let last = AtomicU8::new(0);
    Arc::new(move |percent| {
        let step = percent / PROGRESS_LOG_STEP * PROGRESS_LOG_STEP;
        if step > last.fetch_max(step, Ordering::Relaxed) {
            logger.log_progress(percent);
        }
    })
}

/// Create the job for a render. Take its cancel handle before calling
/// [`run_render`].
pub fn create_job(config: &WorkerConfig) -> WorkerResult<RenderJob> {
    Ok(RenderJob::new(config.render_settings())?)
}

/// Render `request` on `job`, logging the lifecycle.
pub async fn run_render(job: RenderJob, request: &RenderRequest) -> WorkerResult<PathBuf> {
    let logger = JobLogger::new(job.id(), "render");
    let span = logger.create_span();

    logger.log_start(&format!(
        "{} -> {} ({} captions, {} clips)",
        request.video_path.display(),
        request.output_path.display(),
        request.captions.len(),
        request.clips.len()
    ));

    let progress = logging_progress(logger.clone());
    match render_with_job(job, request, Some(progress)).instrument(span).await {
        Ok(path) => {
            logger.log_completion(&path.display().to_string());
            Ok(path)
        }
        Err(e) if e.is_cancelled() => {
            logger.log_warning("cancelled");
            Err(e.into())
        }
        Err(e) => {
            logger.log_error(&e.to_string());
            Err(e.into())
        }
    }
}

/// Effective captions and chunk plan as pretty JSON.
pub async fn plan_json(config: &WorkerConfig, request: &RenderRequest) -> WorkerResult<String> {
    let plan: RenderPlan = plan_render(request, &config.render_settings()).await?;
    Ok(serde_json::to_string_pretty(&plan)?)
}

/// Hardware encoder selection for the configured FFmpeg.
#[derive(Debug, Clone, Serialize)]
pub struct HwReport {
    pub ffmpeg: PathBuf,
    pub preference: Vec<HwAccel>,
    /// Hardware H.264 encoders compiled into FFmpeg
    pub listed: Vec<String>,
    pub selected: HwAccel,
    pub encoder: &'static str,
}

pub async fn probe_hw(config: &WorkerConfig) -> WorkerResult<HwReport> {
    let ffmpeg = capburn_media::check_ffmpeg(&config.ffmpeg_bin)?;
    let listed = hwaccel::probe_encoders(&ffmpeg)
        .await?
        .into_iter()
        .filter(|name| {
            config
                .hw_preference
                .iter()
                .any(|hw| hw.is_hardware() && hw.h264_encoder() == name)
        })
        .collect();
    let runner = FfmpegRunner::new().with_binary(&ffmpeg);
    let selected = select_hw_accel(&runner, &config.hw_preference).await?;

    Ok(HwReport {
        ffmpeg,
        preference: config.hw_preference.clone(),
        listed,
        selected,
        encoder: selected.h264_encoder(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use capburn_models::JobId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_request_with_output_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("request.json");
        tokio::fs::write(
            &path,
            r#"{
                "videoPath": "/media/in.mp4",
                "outputPath": "/media/out.mp4",
                "captions": [
                    {"id": "a", "startTimeMs": 0, "endTimeMs": 1000, "text": "hello"}
                ]
            }"#,
        )
        .await
        .unwrap();

        let request = load_request(&path, Some(Path::new("/elsewhere/out.mp4")))
            .await
            .unwrap();

        assert_eq!(request.video_path, PathBuf::from("/media/in.mp4"));
        assert_eq!(request.output_path, PathBuf::from("/elsewhere/out.mp4"));
        assert_eq!(request.captions.len(), 1);
    }

    #[tokio::test]
    async fn test_load_request_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        let broken = dir.path().join("broken.json");
        tokio::fs::write(&broken, "{ not json").await.unwrap();

        let err = load_request(&missing, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::RequestRead { .. }));
        assert_eq!(err.exit_code(), 2);

        let err = load_request(&broken, None).await.unwrap_err();
        assert!(matches!(err, WorkerError::RequestParse { .. }));
    }

    #[test]
    fn test_logging_progress_steps() {
        let logger = JobLogger::new(&JobId::from_string("p"), "render");
        let sink = logging_progress(logger);
        // Exercise the throttle; repeated and lower values must not panic or regress.
        for pct in [0, 5, 10, 10, 9, 55, 100] {
            sink(pct);
        }
    }

    #[tokio::test]
    async fn test_run_render_reports_cancel() {
        let dir = TempDir::new().unwrap();
        let config = WorkerConfig {
            work_dir: dir.path().join("jobs"),
            hw_preference: Vec::new(),
            ..Default::default()
        };
        let request = RenderRequest::new(dir.path().join("in.mp4"), dir.path().join("out.mp4"));

        let job = create_job(&config).unwrap();
        let temp = job.temp_path().to_path_buf();
        job.cancel();

        let err = run_render(job, &request).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.exit_code(), 130);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_probe_hw_missing_binary() {
        let config = WorkerConfig {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg-capburn"),
            ..Default::default()
        };
        let err = probe_hw(&config).await.unwrap_err();
        assert!(matches!(err, WorkerError::Media(_)));
    }

    #[test]
    fn test_hw_report_serializes() {
        let report = HwReport {
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            preference: vec![HwAccel::Nvenc],
            listed: Vec::new(),
            selected: HwAccel::None,
            encoder: HwAccel::None.h264_encoder(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["selected"], "none");
        assert_eq!(json["preference"][0], "nvenc");
    }
}
