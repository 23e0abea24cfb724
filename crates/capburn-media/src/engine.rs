//! External engine orchestration.
//!
//! [`MediaEngine`] runs one prepared command. [`EngineOrchestrator`] turns
//! units of work (extract, composite, concatenate, replace audio, trim) into
//! engine commands and applies the recovery policy:
//!
//! - hardware compositing failure: retry on the software encoder
//! - resource exhaustion: retry with at most a quarter of the batch size
//! - crash: retry once with explicit alpha conversion, then fall back to the
//!   unit without overlays
//! - cancellation: always returned to the caller

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use capburn_models::{EncodingConfig, RenderState};

use crate::command::{format_secs, FfmpegCommand, FfmpegInput, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::filter_graph::{build_overlay_graph, FilterStrategy};
use crate::job::CancelHandle;
use crate::metrics;
use crate::overlay::OverlayArtifact;
use crate::planner::split_by_time;
use crate::probe::VideoInfo;
use crate::settings::RenderSettings;

/// Unit-local progress sink receiving 0.0..=100.0.
pub type LocalProgress = Arc<dyn Fn(f64) + Send + Sync + 'static>;

/// Runs prepared engine commands.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Run `cmd`, whose output is expected to last `expected_secs`.
    async fn execute(
        &self,
        cmd: &FfmpegCommand,
        expected_secs: f64,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()>;
}

#[async_trait]
impl MediaEngine for FfmpegRunner {
    async fn execute(
        &self,
        cmd: &FfmpegCommand,
        expected_secs: f64,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        match progress {
            Some(progress) => {
                self.run_with_progress(cmd, move |p| progress(p.percentage(expected_secs)))
                    .await
            }
            None => self.run(cmd).await,
        }
    }
}

/// Scale a sink so that 0..100 maps onto `[offset, offset + width)` of it.
pub fn scaled_progress(progress: &Option<LocalProgress>, offset: f64, width: f64) -> Option<LocalProgress> {
    progress.as_ref().map(|inner| {
        let inner = Arc::clone(inner);
        Arc::new(move |pct: f64| inner(offset + pct.clamp(0.0, 100.0) / 100.0 * width)) as LocalProgress
    })
}

/// A time range of an input file.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSlice {
    pub path: PathBuf,
    /// Input seek; `None` reads from the beginning
    pub start_secs: Option<f64>,
    pub duration_secs: f64,
}

impl SourceSlice {
    pub fn new(path: impl Into<PathBuf>, start_secs: f64, duration_secs: f64) -> Self {
        Self {
            path: path.into(),
            start_secs: Some(start_secs),
            duration_secs,
        }
    }

    /// The whole of `path`.
    pub fn whole(path: impl Into<PathBuf>, duration_secs: f64) -> Self {
        Self {
            path: path.into(),
            start_secs: None,
            duration_secs,
        }
    }

    /// A sub-range relative to this slice.
    pub fn sub(&self, offset_secs: f64, duration_secs: f64) -> Self {
        Self {
            path: self.path.clone(),
            start_secs: Some(self.start_secs.unwrap_or(0.0) + offset_secs),
            duration_secs,
        }
    }

    fn command(&self, output: &Path) -> FfmpegCommand {
        let cmd = FfmpegCommand::new(&self.path, output);
        let cmd = match self.start_secs {
            Some(start) => cmd.seek(start),
            None => cmd,
        };
        cmd.duration(self.duration_secs)
    }
}

/// Limits and switches for one orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_overlays_per_batch: usize,
    pub max_filter_arg_bytes: usize,
    pub index_epsilon_secs: f64,
    /// Use the configured hardware encoder for compositing too
    pub hw_compositing: bool,
    /// Caption-free units may be stream-copied
    pub allow_stream_copy: bool,
    /// The source carries an audio stream
    pub has_audio: bool,
    /// Keyframe times of the file units are cut from; a stream copy only
    /// starts on one of them
    pub keyframes: Vec<f64>,
    /// Distance from a keyframe that still counts as on it
    pub keyframe_tolerance_secs: f64,
}

impl OrchestratorConfig {
    pub fn new(settings: &RenderSettings, source: &VideoInfo, framerate_override: bool) -> Self {
        Self {
            max_overlays_per_batch: settings.max_overlays_per_batch.max(1),
            max_filter_arg_bytes: settings.max_filter_arg_bytes,
            index_epsilon_secs: settings.index_epsilon_secs,
            hw_compositing: settings.hw_compositing,
            allow_stream_copy: source.is_copy_compatible() && !framerate_override,
            has_audio: source.has_audio,
            keyframes: Vec::new(),
            keyframe_tolerance_secs: source.frame_secs() / 2.0,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let settings = RenderSettings::default();
        Self {
            max_overlays_per_batch: settings.max_overlays_per_batch,
            max_filter_arg_bytes: settings.max_filter_arg_bytes,
            index_epsilon_secs: settings.index_epsilon_secs,
            hw_compositing: settings.hw_compositing,
            allow_stream_copy: false,
            has_audio: true,
            keyframes: Vec::new(),
            keyframe_tolerance_secs: 1.0 / 60.0,
        }
    }
}

/// The keyframe within `tolerance` of `start`, if any. `keyframes` must be
/// sorted.
pub fn keyframe_at(keyframes: &[f64], start: f64, tolerance: f64) -> Option<f64> {
    let idx = keyframes.partition_point(|&k| k < start - tolerance);
    keyframes.get(idx).copied().filter(|&k| k <= start + tolerance)
}

/// Drives the engine for every unit of work of one render job.
pub struct EngineOrchestrator {
    engine: Arc<dyn MediaEngine>,
    encoding: EncodingConfig,
    config: OrchestratorConfig,
    work_dir: PathBuf,
    cancel: CancelHandle,
    counter: AtomicUsize,
}

impl EngineOrchestrator {
    /// Intermediate files are written to `work_dir`.
    pub fn new(engine: Arc<dyn MediaEngine>, encoding: EncodingConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            encoding,
            config: OrchestratorConfig::default(),
            work_dir: work_dir.into(),
            cancel: CancelHandle::new(),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Keyframes of the file passthrough units are cut from.
    pub fn with_keyframes(mut self, keyframes: Vec<f64>) -> Self {
        self.config.keyframes = keyframes;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn encoding(&self) -> &EncodingConfig {
        &self.encoding
    }

    /// A fresh path in the work directory.
    pub fn scratch_path(&self, stem: &str, extension: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.work_dir.join(format!("{}_{:05}.{}", stem, n, extension))
    }

    /// Run one command, tracking its state, duration and outcome.
    async fn invoke(
        &self,
        operation: &'static str,
        cmd: &FfmpegCommand,
        expected_secs: f64,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let unit = cmd.output().display().to_string();
        debug!(operation, unit = %unit, state = RenderState::Building.as_str(), "Engine unit built");
        self.cancel.check()?;

        let running = Arc::new(AtomicBool::new(false));
        let tracked: LocalProgress = {
            let running = Arc::clone(&running);
            let unit = unit.clone();
            Arc::new(move |pct: f64| {
                if !running.swap(true, Ordering::Relaxed) {
                    debug!(operation, unit = %unit, state = RenderState::Running.as_str(), "Engine unit running");
                }
                if let Some(progress) = &progress {
                    progress(pct);
                }
            })
        };

        debug!(operation, unit = %unit, state = RenderState::Started.as_str(), "Engine unit started");
        let started = Instant::now();
        let result = self.engine.execute(cmd, expected_secs, Some(tracked)).await;
        let elapsed = started.elapsed().as_secs_f64();

        let state = match &result {
            Ok(()) => RenderState::Succeeded,
            Err(e) if e.is_cancelled() => RenderState::Cancelled,
            Err(_) => RenderState::Failed,
        };
        metrics::record_engine_invocation(operation, state.as_str(), elapsed);
        debug!(operation, unit = %unit, state = state.as_str(), elapsed_secs = elapsed, "Engine unit finished");
        result
    }

    /// Stream-copy a slice of the source.
    pub async fn extract_copy(
        &self,
        source: &SourceSlice,
        output: &Path,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let cmd = source
            .command(output)
            .map("0:v:0")
            .map("0:a:0?")
            .codec_copy()
            .output_args(["-avoid_negative_ts", "make_zero"]);
        self.invoke("extract", &cmd, source.duration_secs, progress).await
    }

    fn plain_command(&self, source: &SourceSlice, output: &Path, encoding: &EncodingConfig) -> FfmpegCommand {
        source
            .command(output)
            .map("0:v:0")
            .map("0:a:0?")
            .output_args(encoding.video_args())
            .output_args(encoding.audio_args())
            .output_args(encoding.extra_args.iter().cloned())
    }

    /// Re-encode a slice without any filter. Hardware encoding falls back
    /// to software on failure.
    pub async fn encode_plain(
        &self,
        source: &SourceSlice,
        output: &Path,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let cmd = self.plain_command(source, output, &self.encoding);
        match self.invoke("encode", &cmd, source.duration_secs, progress.clone()).await {
            Err(e) if self.encoding.hw_accel.is_hardware() && is_engine_failure(&e) => {
                warn!(
                    encoder = self.encoding.hw_accel.h264_encoder(),
                    "Hardware encode failed, retrying in software: {}", e
                );
                metrics::record_engine_retry("software");
                let cmd = self.plain_command(source, output, &self.encoding.software());
                self.invoke("encode", &cmd, source.duration_secs, progress).await
            }
            other => other,
        }
    }

    /// Caption-free unit: stream copy when allowed and the slice starts on a
    /// keyframe, otherwise a plain encode.
    pub async fn passthrough(
        &self,
        source: &SourceSlice,
        output: &Path,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        if self.config.allow_stream_copy {
            if let Some(aligned) = self.copy_slice(source) {
                return self.extract_copy(&aligned, output, progress).await;
            }
            debug!(start = ?source.start_secs, "Slice does not start on a keyframe, re-encoding");
        }
        self.encode_plain(source, output, progress).await
    }

    /// `source` moved onto the keyframe it starts at. `None` when a copy
    /// would begin before the slice and repeat earlier footage.
    fn copy_slice(&self, source: &SourceSlice) -> Option<SourceSlice> {
        let tolerance = self.config.keyframe_tolerance_secs;
        let start = match source.start_secs {
            Some(start) if start > tolerance => start,
            _ => return Some(source.clone()),
        };
        let keyframe = keyframe_at(&self.config.keyframes, start, tolerance)?;
        Some(SourceSlice {
            path: source.path.clone(),
            start_secs: Some(keyframe),
            duration_secs: start + source.duration_secs - keyframe,
        })
    }

    /// Burn `overlays` (relative to the slice start) into a slice.
    pub async fn composite(
        &self,
        source: &SourceSlice,
        overlays: &[OverlayArtifact],
        output: &Path,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        if overlays.is_empty() {
            return self.passthrough(source, output, progress).await;
        }

        let mut batch = self.config.max_overlays_per_batch.max(1);
        let mut strategy = FilterStrategy::Standard;
        let mut use_hw = self.config.hw_compositing && self.encoding.hw_accel.is_hardware();
        let mut attempt = 1u32;

        loop {
            self.cancel.check()?;
            let encoding = if use_hw {
                self.encoding.clone()
            } else {
                self.encoding.software()
            };

            let result = self
                .composite_pass(source, overlays, output, batch, strategy, &encoding, progress.clone())
                .await;

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            if use_hw && is_engine_failure(&err) {
                warn!(attempt, "Hardware compositing failed, retrying in software: {}", err);
                metrics::record_engine_retry("software");
                use_hw = false;
            } else if err.is_resource_exhaustion() && batch > 1 {
                let smaller = (batch / 4).max(1);
                warn!(attempt, batch, smaller, "Engine ran out of resources, retrying with smaller batches: {}", err);
                metrics::record_engine_retry("resource");
                batch = smaller;
            } else if err.is_crash() && strategy == FilterStrategy::Standard {
                warn!(attempt, "Engine crashed, retrying with explicit alpha conversion: {}", err);
                metrics::record_engine_retry("crash");
                strategy = FilterStrategy::AlphaFormat;
            } else if err.is_crash() {
                warn!(
                    attempt,
                    overlays = overlays.len(),
                    output = %output.display(),
                    "Engine crashed again, writing this unit without captions: {}", err
                );
                metrics::record_engine_retry("no_overlay");
                return self.passthrough(source, output, progress).await;
            } else {
                return Err(err);
            }
            attempt += 1;
        }
    }

    /// One compositing attempt at a fixed batch size and strategy.
    #[allow(clippy::too_many_arguments)]
    async fn composite_pass(
        &self,
        source: &SourceSlice,
        overlays: &[OverlayArtifact],
        output: &Path,
        batch: usize,
        strategy: FilterStrategy,
        encoding: &EncodingConfig,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let units = split_by_time(source.duration_secs, overlays, batch);
        if units.len() == 1 {
            return self
                .composite_slice(source, &units[0].overlays, output, batch, strategy, encoding, progress)
                .await;
        }

        debug!(sub_units = units.len(), batch, "Splitting unit by time");
        let total = source.duration_secs.max(f64::EPSILON);
        let mut parts = Vec::with_capacity(units.len());
        for unit in &units {
            self.cancel.check()?;
            let slice = source.sub(unit.start_secs, unit.end_secs - unit.start_secs);
            let part = self.scratch_path("sub", "ts");
            let sub_progress = scaled_progress(
                &progress,
                unit.start_secs / total * 95.0,
                slice.duration_secs / total * 95.0,
            );
            if unit.overlays.is_empty() {
                self.passthrough(&slice, &part, sub_progress).await?;
            } else {
                self.composite_slice(&slice, &unit.overlays, &part, batch, strategy, encoding, sub_progress)
                    .await?;
            }
            parts.push(part);
        }
        self.concat(&parts, output, scaled_progress(&progress, 95.0, 5.0)).await
    }

    /// Composite a slice whose overlays cannot be cut further by time,
    /// layering batches onto intermediate files when there are too many.
    #[allow(clippy::too_many_arguments)]
    async fn composite_slice(
        &self,
        source: &SourceSlice,
        overlays: &[OverlayArtifact],
        output: &Path,
        batch: usize,
        strategy: FilterStrategy,
        encoding: &EncodingConfig,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let groups: Vec<&[OverlayArtifact]> = overlays.chunks(batch.max(1)).collect();
        if groups.len() > 1 {
            debug!(layers = groups.len(), overlays = overlays.len(), batch, "Layering overlay batches");
        }

        let width = 100.0 / groups.len() as f64;
        let mut input = source.clone();
        for (layer, group) in groups.iter().enumerate() {
            self.cancel.check()?;
            let last = layer + 1 == groups.len();
            let target = if last {
                output.to_path_buf()
            } else {
                self.scratch_path("layer", "ts")
            };
            self.run_graph(
                &input,
                group,
                &target,
                strategy,
                encoding,
                scaled_progress(&progress, layer as f64 * width, width),
            )
            .await?;
            input = SourceSlice::whole(target, source.duration_secs);
        }
        Ok(())
    }

    async fn run_graph(
        &self,
        source: &SourceSlice,
        overlays: &[OverlayArtifact],
        output: &Path,
        strategy: FilterStrategy,
        encoding: &EncodingConfig,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let graph = build_overlay_graph(overlays, self.config.index_epsilon_secs, strategy);

        let mut cmd = source.command(output);
        for overlay in overlays {
            cmd = cmd.add_input(FfmpegInput::new(&overlay.path));
        }
        cmd = if graph.needs_script(self.config.max_filter_arg_bytes) {
            let script = self.scratch_path("graph", "txt");
            graph.write_script(&script).await?;
            debug!(bytes = graph.graph.len(), script = %script.display(), "Filter graph written to script");
            cmd.filter_complex_script(&script)
        } else {
            cmd.filter_complex(graph.graph.clone())
        };

        let cmd = cmd
            .map(graph.map_label())
            .map("0:a:0?")
            .output_args(encoding.video_args())
            .output_args(encoding.audio_args())
            .output_args(encoding.extra_args.iter().cloned());

        debug!(
            overlays = overlays.len(),
            strategy = ?strategy,
            encoder = encoding.hw_accel.h264_encoder(),
            "Compositing overlays"
        );
        self.invoke("composite", &cmd, source.duration_secs, progress).await
    }

    /// Concatenate `parts` in order into `output` without re-encoding.
    pub async fn concat(&self, parts: &[PathBuf], output: &Path, progress: Option<LocalProgress>) -> MediaResult<()> {
        if parts.is_empty() {
            return Err(MediaError::internal("nothing to concatenate"));
        }

        let list = self.scratch_path("concat", "txt");
        tokio::fs::write(&list, concat_list(parts)).await?;

        let mut cmd = FfmpegCommand::new(&list, output)
            .input_args(["-f", "concat", "-safe", "0"])
            .map("0")
            .codec_copy();
        if is_mp4_family(output) {
            if self.config.has_audio {
                cmd = cmd.output_args(["-bsf:a", "aac_adtstoasc"]);
            }
            cmd = cmd.faststart();
        }

        debug!(parts = parts.len(), output = %output.display(), "Concatenating");
        self.invoke("concat", &cmd, 0.0, progress).await
    }

    /// Swap the audio track: video copied, audio re-encoded, shortest input wins.
    pub async fn replace_audio(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        expected_secs: f64,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let mut cmd = FfmpegCommand::new(video, output)
            .add_input(FfmpegInput::new(audio))
            .map("0:v:0")
            .map("1:a:0")
            .video_codec("copy")
            .output_args(self.encoding.audio_args())
            .output_arg("-shortest");
        if is_mp4_family(output) {
            cmd = cmd.faststart();
        }

        info!(audio = %audio.display(), "Replacing audio track");
        self.invoke("replace_audio", &cmd, expected_secs, progress).await
    }

    /// Re-encode the kept `segments` (original-time seconds) of `source`
    /// and join them into `output`.
    pub async fn trim_to_segments(
        &self,
        source: &Path,
        segments: &[(f64, f64)],
        output: &Path,
        progress: Option<LocalProgress>,
    ) -> MediaResult<()> {
        let kept: Vec<(f64, f64)> = segments.iter().copied().filter(|(s, e)| e > s).collect();
        if kept.is_empty() {
            return Err(MediaError::invalid_input("every clip of the video is removed"));
        }

        let total: f64 = kept.iter().map(|(s, e)| e - s).sum::<f64>().max(f64::EPSILON);
        let mut done = 0.0;
        let mut parts = Vec::with_capacity(kept.len());

        for (index, (start, end)) in kept.iter().enumerate() {
            self.cancel.check()?;
            let slice = SourceSlice::new(source, *start, end - start);
            let part = self.scratch_path("trim", "ts");
            debug!(segment = index, start = %format_secs(*start), end = %format_secs(*end), "Extracting kept segment");
            self.encode_plain(
                &slice,
                &part,
                scaled_progress(&progress, done / total * 95.0, slice.duration_secs / total * 95.0),
            )
            .await?;
            done += slice.duration_secs;
            parts.push(part);
        }

        self.concat(&parts, output, scaled_progress(&progress, 95.0, 5.0)).await
    }
}

impl std::fmt::Debug for EngineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOrchestrator")
            .field("encoding", &self.encoding)
            .field("config", &self.config)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

fn is_engine_failure(e: &MediaError) -> bool {
    matches!(e, MediaError::EngineFailed { .. } | MediaError::Timeout(_))
}

fn is_mp4_family(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            matches!(ext.as_str(), "mp4" | "m4v" | "mov")
        })
        .unwrap_or(false)
}

/// Concat demuxer list, one quoted `file` line per part.
///
/// The demuxer resolves relative entries against the list's directory, so
/// paths are made absolute first.
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| {
            let path = std::path::absolute(p).unwrap_or_else(|_| p.clone());
            format!("file '{}'\n", path.to_string_lossy().replace('\'', "'\\''"))
        })
        .collect()
}
