//! The caption burn-in pipeline.
//!
//! # Phases
//!
//! 1. Validate the request and prepare captions (timing faults are dropped
//!    with a diagnostic)
//! 2. Probe the source and remap captions onto the effective timeline
//! 3. Trim: when clips are removed, re-encode the kept segments into one base
//! 4. Overlays: rasterize one PNG per caption state on the worker pool
//! 5. Plan chunks and composite each one (stream copy where caption-free)
//! 6. Finalize: concatenate, replace audio, validate and move the output
//!
//! Every exit path removes the job's temp directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use capburn_models::{CaptionSegment, EncodingConfig, RenderRequest};

use crate::engine::{EngineOrchestrator, LocalProgress, MediaEngine, OrchestratorConfig, SourceSlice};
use crate::error::{MediaError, MediaResult};
use crate::fs_utils::{move_file, validate_output_file};
use crate::hwaccel::select_hw_accel;
use crate::job::RenderJob;
use crate::metrics;
use crate::overlay::pool::RenderTarget;
use crate::overlay::{plan_overlays, render_overlays, FontBook, OverlayArtifact, OverlayPoolConfig, OverlaySpec};
use crate::planner::{plan_chunks, Chunk, ChunkPolicy};
use crate::probe::{list_keyframes, probe_video_with, VideoInfo};
use crate::progress::{ProgressAggregator, ProgressFn, ProgressPlan, RenderPhase};
use crate::settings::RenderSettings;
use crate::timeline::{DroppedCaption, MappedCaptions, TimelineMapper};

/// What a render would do, without running the engine.
#[derive(Debug, Clone, Serialize)]
pub struct RenderPlan {
    pub source: VideoInfo,
    /// Kept `(start, end)` ranges of the source in seconds; empty when untrimmed
    pub kept_segments: Vec<(f64, f64)>,
    pub effective_duration_secs: f64,
    /// Captions on the effective timeline
    pub captions: Vec<CaptionSegment>,
    pub dropped: Vec<DroppedCaption>,
    pub dropped_words: usize,
    pub overlay_count: usize,
    pub chunks: Vec<Chunk>,
}

/// Request state shared by planning and rendering.
struct Prepared {
    source: VideoInfo,
    mapper: TimelineMapper,
    mapped: MappedCaptions,
    specs: Vec<OverlaySpec>,
}

fn chunk_policy(settings: &RenderSettings) -> ChunkPolicy {
    if settings.smart_chunking {
        ChunkPolicy::Smart {
            window_secs: settings.smart_window_secs,
        }
    } else {
        ChunkPolicy::Fixed {
            window_secs: settings.chunk_secs,
        }
    }
}

/// Drop captions with broken bounds and strip broken words from the rest.
///
/// Returns the usable captions and the number of captions dropped.
pub fn prepare_captions(captions: &[CaptionSegment]) -> (Vec<CaptionSegment>, usize) {
    let mut kept = Vec::with_capacity(captions.len());
    let mut dropped = 0usize;

    for caption in captions {
        match caption.validate() {
            Ok(()) => kept.push(caption.clone()),
            Err(fault) if fault.is_word_fault() => {
                let mut caption = caption.clone();
                let removed = caption.retain_valid_words();
                warn!(caption = %caption.id, removed, "Dropping words with invalid timing: {}", fault);
                kept.push(caption);
            }
            Err(fault) => {
                warn!(caption = %caption.id, "Dropping caption: {}", fault);
                dropped += 1;
            }
        }
    }
    (kept, dropped)
}

/// Kept source ranges in seconds, clamped to the source duration.
fn kept_segments(mapper: &TimelineMapper, source_duration: f64) -> Vec<(f64, f64)> {
    if mapper.is_identity() {
        return Vec::new();
    }
    mapper
        .segments()
        .iter()
        .map(|s| {
            let start = (s.original_start as f64 / 1000.0).min(source_duration);
            let end = (s.original_end as f64 / 1000.0).min(source_duration);
            (start, end)
        })
        .filter(|(start, end)| end > start)
        .collect()
}

fn check_request(request: &RenderRequest) -> MediaResult<()> {
    request
        .validate()
        .map_err(|e| MediaError::invalid_input(e.to_string()))?;

    if let Some(parent) = request.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(MediaError::invalid_input(format!(
                "Output directory does not exist: {}",
                parent.display()
            )));
        }
    }
    if let Some(audio) = &request.replacement_audio {
        if !audio.is_file() {
            return Err(MediaError::invalid_input(format!(
                "Replacement audio does not exist: {}",
                audio.display()
            )));
        }
    }
    Ok(())
}

async fn prepare(request: &RenderRequest, settings: &RenderSettings) -> MediaResult<Prepared> {
    check_request(request)?;

    let (captions, invalid) = prepare_captions(&request.captions);
    metrics::record_captions_dropped(invalid);

    let source = probe_video_with(&settings.ffprobe_bin, &request.video_path).await?;
    if source.duration <= 0.0 {
        return Err(MediaError::invalid_input(format!(
            "Source video has no duration: {}",
            request.video_path.display()
        )));
    }

    let mapper = TimelineMapper::new(&request.clips);
    let mapped = mapper.map_captions(&captions, settings.min_caption_ms);
    metrics::record_captions_dropped(mapped.dropped.len());
    if !mapped.dropped.is_empty() || mapped.dropped_words > 0 {
        info!(
            dropped = mapped.dropped.len(),
            dropped_words = mapped.dropped_words,
            "Captions removed while remapping onto the trimmed timeline"
        );
    }

    let burned_in = mapped.captions.iter().filter(|c| c.is_burned_in()).count();
    if request.require_captions && burned_in == 0 {
        return Err(MediaError::timing(format!(
            "no caption survived validation and remapping ({} supplied)",
            request.captions.len()
        )));
    }

    let specs = plan_overlays(&mapped.captions, settings.boundary_epsilon_secs);
    Ok(Prepared {
        source,
        mapper,
        mapped,
        specs,
    })
}

/// Plan a render without running the engine or rasterizing anything.
pub async fn plan_render(request: &RenderRequest, settings: &RenderSettings) -> MediaResult<RenderPlan> {
    let settings = settings.clone().normalized();
    let prepared = prepare(request, &settings).await?;

    let kept = kept_segments(&prepared.mapper, prepared.source.duration);
    if !prepared.mapper.is_identity() && kept.is_empty() {
        return Err(MediaError::invalid_input("every clip of the video is removed"));
    }
    let effective_duration_secs = if kept.is_empty() {
        prepared.source.duration
    } else {
        kept.iter().map(|(s, e)| e - s).sum()
    };

    let planned: Vec<OverlayArtifact> = prepared
        .specs
        .iter()
        .map(|spec| OverlayArtifact::new(spec.file_name(0), spec.start_secs, spec.end_secs))
        .collect();
    let chunks = plan_chunks(chunk_policy(&settings), effective_duration_secs, &planned);

    Ok(RenderPlan {
        source: prepared.source,
        kept_segments: kept,
        effective_duration_secs,
        captions: prepared.mapped.captions,
        dropped: prepared.mapped.dropped,
        dropped_words: prepared.mapped.dropped_words,
        overlay_count: planned.len(),
        chunks,
    })
}

/// Burn the request's captions into its video.
///
/// Resolves to the output path once the file exists and is non-empty.
pub async fn render_video_with_captions(
    request: &RenderRequest,
    settings: RenderSettings,
    progress: Option<ProgressFn>,
) -> MediaResult<PathBuf> {
    let job = RenderJob::new(settings)?;
    render_with_job(job, request, progress).await
}

/// Run a render on a caller-created job.
///
/// Take [`RenderJob::cancel_handle`] before calling to cancel from another
/// task. The job's temp directory is removed before this returns.
pub async fn render_with_job(
    mut job: RenderJob,
    request: &RenderRequest,
    progress: Option<ProgressFn>,
) -> MediaResult<PathBuf> {
    let started = Instant::now();
    metrics::render_job_started();
    info!(
        job_id = %job.id(),
        video = %request.video_path.display(),
        output = %request.output_path.display(),
        captions = request.captions.len(),
        "Starting caption render"
    );

    let mut result = run_pipeline(&mut job, request, progress).await;

    // Failures caused by killed processes are cancellations
    if result.is_err() && job.cancel_handle().is_cancelled() {
        result = Err(MediaError::Cancelled);
    }

    let elapsed = started.elapsed().as_secs_f64();
    let outcome = match &result {
        Ok(path) => {
            info!(job_id = %job.id(), output = %path.display(), elapsed_secs = elapsed, "Caption render complete");
            "succeeded"
        }
        Err(MediaError::Cancelled) => {
            info!(job_id = %job.id(), elapsed_secs = elapsed, "Caption render cancelled");
            "cancelled"
        }
        Err(e) => {
            warn!(job_id = %job.id(), elapsed_secs = elapsed, "Caption render failed: {}", e);
            "failed"
        }
    };
    metrics::record_render_job(outcome, elapsed);
    metrics::render_job_finished();

    job.close();
    result
}

async fn run_pipeline(
    job: &mut RenderJob,
    request: &RenderRequest,
    progress: Option<ProgressFn>,
) -> MediaResult<PathBuf> {
    let settings = job.settings().clone();
    let prepared = prepare(request, &settings).await?;
    let Prepared {
        source,
        mapper,
        mapped: _,
        specs,
    } = prepared;

    let trimming = !mapper.is_identity();
    job.set_progress(ProgressPlan::for_pipeline(trimming), progress);
    let aggregator = Arc::clone(job.progress());
    job.check_cancelled()?;

    let hw = select_hw_accel(&job.runner(), &settings.hw_preference).await?;
    let mut encoding = EncodingConfig::for_quality(request.export.quality).with_hw_accel(hw);
    if let Some(fps) = request.export.framerate {
        encoding = encoding.with_framerate(fps);
    }

    let units_dir = job.temp_subdir("units").await?;
    let engine: Arc<dyn MediaEngine> = Arc::new(job.runner());
    let base_orchestrator = |info: &VideoInfo| {
        EngineOrchestrator::new(Arc::clone(&engine), encoding.clone(), &units_dir)
            .with_config(OrchestratorConfig::new(&settings, info, request.export.framerate.is_some()))
            .with_cancel(job.cancel_handle())
    };

    // Trim
    let (base_path, base_info) = if trimming {
        let kept = kept_segments(&mapper, source.duration);
        info!(job_id = %job.id(), segments = kept.len(), "Trimming source to kept clips");
        let trimmed = job.temp_file("trimmed.ts");
        let sink = phase_progress(&aggregator, RenderPhase::Trim);
        base_orchestrator(&source)
            .trim_to_segments(&request.video_path, &kept, &trimmed, Some(sink))
            .await?;
        aggregator.complete(RenderPhase::Trim);
        let info = probe_video_with(&settings.ffprobe_bin, &trimmed).await?;
        (trimmed, info)
    } else {
        (request.video_path.clone(), source.clone())
    };
    job.check_cancelled()?;

    // Overlays
    let overlay_count = specs.len();
    let artifacts = if specs.is_empty() {
        Vec::new()
    } else {
        let target = RenderTarget {
            fonts: Arc::new(FontBook::new(settings.font_dir.as_deref(), &settings.default_font_family)),
            width: base_info.width,
            height: base_info.height,
            out_dir: job.temp_subdir("overlays").await?,
        };
        let overlay_progress = Arc::clone(&aggregator);
        render_overlays(
            specs,
            target,
            OverlayPoolConfig::from(&settings),
            job.cancel_handle().subscribe(),
            move |pct| {
                overlay_progress.report(RenderPhase::Overlays, pct);
            },
        )
        .await?
    };
    aggregator.complete(RenderPhase::Overlays);
    debug!(job_id = %job.id(), overlays = overlay_count, "Overlay artifacts ready");
    job.check_cancelled()?;

    // Compositing
    let total_secs = base_info.duration;
    let chunks = plan_chunks(chunk_policy(&settings), total_secs, &artifacts);
    info!(
        job_id = %job.id(),
        chunks = chunks.len(),
        with_captions = chunks.iter().filter(|c| c.has_captions).count(),
        duration_secs = total_secs,
        encoder = encoding.hw_accel.h264_encoder(),
        "Compositing chunks"
    );

    let mut orchestrator = base_orchestrator(&base_info);
    if orchestrator.config().allow_stream_copy {
        match list_keyframes(&settings.ffprobe_bin, &base_path).await {
            Ok(keyframes) => {
                debug!(job_id = %job.id(), keyframes = keyframes.len(), "Indexed keyframes for stream copy");
                orchestrator = orchestrator.with_keyframes(keyframes);
            }
            Err(e) => warn!(
                job_id = %job.id(),
                "Could not list keyframes, caption-free chunks will be re-encoded: {}", e
            ),
        }
    }
    let mut parts = Vec::with_capacity(chunks.len());
    let mut done_secs = 0.0;
    for chunk in &chunks {
        job.check_cancelled()?;
        let slice = SourceSlice::new(&base_path, chunk.start_secs, chunk.duration_secs());
        let part = units_dir.join(format!("chunk_{:04}.ts", chunk.index));
        let sink = chunk_progress(&aggregator, done_secs, chunk.duration_secs(), total_secs);

        debug!(
            job_id = %job.id(),
            chunk = chunk.index,
            start = chunk.start_secs,
            end = chunk.end_secs,
            overlays = chunk.overlays.len(),
            "Processing chunk"
        );
        if chunk.has_captions {
            orchestrator
                .composite(&slice, &chunk.overlays, &part, Some(sink))
                .await?;
        } else {
            orchestrator.passthrough(&slice, &part, Some(sink)).await?;
        }
        done_secs += chunk.duration_secs();
        parts.push(part);
    }
    aggregator.complete(RenderPhase::Compositing);
    job.check_cancelled()?;

    // Finalize
    let extension = request
        .output_path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    let joined = job.temp_file(format!("joined.{}", extension));
    orchestrator.concat(&parts, &joined, None).await?;
    aggregator.report(RenderPhase::Finalize, 40.0);

    let finished = match &request.replacement_audio {
        Some(audio) => {
            let with_audio = job.temp_file(format!("final.{}", extension));
            orchestrator
                .replace_audio(&joined, audio, &with_audio, total_secs, None)
                .await?;
            with_audio
        }
        None => joined,
    };
    aggregator.report(RenderPhase::Finalize, 70.0);

    validate_render(&settings.ffprobe_bin, &finished, total_secs, request.replacement_audio.is_some()).await?;
    move_file(&finished, &request.output_path).await?;
    aggregator.complete(RenderPhase::Finalize);

    Ok(request.output_path.clone())
}

/// The output must exist, be non-empty and probe as a video.
async fn validate_render(ffprobe: &Path, path: &Path, expected_secs: f64, audio_replaced: bool) -> MediaResult<()> {
    let bytes = validate_output_file(path).await?;
    let info = probe_video_with(ffprobe, path)
        .await
        .map_err(|e| MediaError::output_invalid(path, format!("output does not probe: {}", e)))?;

    let tolerance = (info.frame_secs() * 2.0).max(0.5);
    // A shorter replacement track legitimately shortens the output
    if (info.duration - expected_secs).abs() > tolerance && !(audio_replaced && info.duration < expected_secs) {
        warn!(
            expected_secs,
            actual_secs = info.duration,
            "Output duration differs from the planned duration"
        );
    }
    debug!(bytes, duration_secs = info.duration, "Output validated");
    Ok(())
}

fn phase_progress(aggregator: &Arc<ProgressAggregator>, phase: RenderPhase) -> LocalProgress {
    let aggregator = Arc::clone(aggregator);
    Arc::new(move |pct| {
        aggregator.report(phase, pct);
    })
}

/// Chunk-local progress onto the compositing band by elapsed media time.
fn chunk_progress(
    aggregator: &Arc<ProgressAggregator>,
    done_secs: f64,
    chunk_secs: f64,
    total_secs: f64,
) -> LocalProgress {
    let aggregator = Arc::clone(aggregator);
    let total = total_secs.max(f64::EPSILON);
    Arc::new(move |pct| {
        let secs = done_secs + pct.clamp(0.0, 100.0) / 100.0 * chunk_secs;
        aggregator.report(RenderPhase::Compositing, secs / total * 100.0);
    })
}
