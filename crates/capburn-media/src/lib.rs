#![deny(unreachable_patterns)]
//! Caption burn-in rendering on top of the FFmpeg CLI.
//!
//! This crate provides:
//! - Timeline remapping of captions onto clip-trimmed video
//! - Overlay rasterization on a bounded worker pool
//! - Chunk planning with stream copy for caption-free spans
//! - Filter-graph construction and engine orchestration with retries
//! - Hardware encoder selection with software fallback
//! - Cancellation, progress aggregation and per-job temp directories

pub mod command;
pub mod engine;
pub mod error;
pub mod filter_graph;
pub mod fs_utils;
pub mod hwaccel;
pub mod job;
pub mod metrics;
pub mod overlay;
pub mod pipeline;
pub mod planner;
pub mod probe;
pub mod progress;
pub mod settings;
pub mod timeline;

pub use command::{check_ffmpeg, check_ffprobe, format_secs, FfmpegCommand, FfmpegInput, FfmpegRunner};
pub use engine::{EngineOrchestrator, LocalProgress, MediaEngine, OrchestratorConfig, SourceSlice};
pub use error::{EngineFailureKind, MediaError, MediaResult};
pub use filter_graph::{build_overlay_graph, FilterGraph, FilterStrategy};
pub use hwaccel::select_hw_accel;
pub use job::{CancelHandle, ProcessRegistry, RenderJob};
pub use overlay::{plan_overlays, FontBook, OverlayArtifact, OverlaySpec};
pub use pipeline::{plan_render, render_video_with_captions, render_with_job, RenderPlan};
pub use planner::{plan_chunks, Chunk, ChunkPolicy};
pub use probe::{list_keyframes, probe_video, probe_video_with, VideoInfo};
pub use progress::{FfmpegProgress, ProgressAggregator, ProgressFn, ProgressPlan, RenderPhase};
pub use settings::RenderSettings;
pub use timeline::{MappedCaptions, TimelineMapper};
