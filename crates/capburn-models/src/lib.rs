//! Shared data models for the caption burn-in renderer.
//!
//! This crate provides Serde-serializable types for:
//! - Caption segments and word timing
//! - Caption styles
//! - Clip-trim edits
//! - Encoding configuration and quality tiers
//! - Render requests and job identifiers

pub mod caption;
pub mod clip;
pub mod encoding;
pub mod job;
pub mod style;

// Re-export common types
pub use caption::{CaptionError, CaptionResult, CaptionSegment, WordTiming};
pub use clip::{clips_from_removed_spans, has_removed_clips, VideoClip};
pub use encoding::{EncodingConfig, HwAccel, Quality};
pub use job::{ExportConfig, JobId, RenderRequest, RenderState, RequestError};
pub use style::{
    CaptionStyle, HighlightMode, RenderMode, Rgba, StyleError, TextAlign, TextTransform,
};
