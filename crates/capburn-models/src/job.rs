//! Render job definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::caption::{CaptionError, CaptionSegment};
use crate::clip::VideoClip;
use crate::encoding::Quality;
use crate::style::StyleError;

/// Unique identifier for a render job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in temp directory names.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a unit of work handed to the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RenderState {
    /// Inputs and filter graph are being prepared
    #[default]
    Building,
    /// Engine process spawned
    Started,
    /// Engine reporting progress
    Running,
    /// Output produced
    Succeeded,
    /// Unrecoverable error
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl RenderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderState::Building => "building",
            RenderState::Started => "started",
            RenderState::Running => "running",
            RenderState::Succeeded => "succeeded",
            RenderState::Failed => "failed",
            RenderState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RenderState::Succeeded | RenderState::Failed | RenderState::Cancelled
        )
    }
}

impl fmt::Display for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Export settings chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    /// Output frame rate; `None` keeps the source rate
    #[serde(default)]
    pub framerate: Option<f64>,
    /// Quality tier
    #[serde(default)]
    pub quality: Quality,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            framerate: None,
            quality: Quality::Medium,
        }
    }
}

/// A request to burn captions into a video.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    /// Source video
    pub video_path: PathBuf,
    /// Destination file
    pub output_path: PathBuf,
    /// Captions on the original timeline
    #[serde(default)]
    pub captions: Vec<CaptionSegment>,
    /// Optional trim edits
    #[serde(default)]
    pub clips: Vec<VideoClip>,
    /// Optional replacement audio track
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_audio: Option<PathBuf>,
    /// Export settings
    #[serde(default)]
    pub export: ExportConfig,
    /// Fail instead of rendering a caption-free copy when every caption is dropped
    #[serde(default)]
    pub require_captions: bool,
}

impl RenderRequest {
    pub fn new(video_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            video_path: video_path.into(),
            output_path: output_path.into(),
            captions: Vec::new(),
            clips: Vec::new(),
            replacement_audio: None,
            export: ExportConfig::default(),
            require_captions: false,
        }
    }

    pub fn with_captions(mut self, captions: Vec<CaptionSegment>) -> Self {
        self.captions = captions;
        self
    }

    pub fn with_clips(mut self, clips: Vec<VideoClip>) -> Self {
        self.clips = clips;
        self
    }

    pub fn with_export(mut self, export: ExportConfig) -> Self {
        self.export = export;
        self
    }

    pub fn with_replacement_audio(mut self, audio: impl Into<PathBuf>) -> Self {
        self.replacement_audio = Some(audio.into());
        self
    }

    /// Structural validation. Caption timing faults are not reported here;
    /// use [`RenderRequest::caption_faults`] for those.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.video_path.as_os_str().is_empty() {
            return Err(RequestError::MissingVideoPath);
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(RequestError::MissingOutputPath);
        }
        if let Some(fps) = self.export.framerate {
            if !(fps > 0.0 && fps <= 240.0) {
                return Err(RequestError::InvalidFramerate(fps));
            }
        }
        for (index, clip) in self.clips.iter().enumerate() {
            if clip.start_time >= clip.end_time {
                return Err(RequestError::InvalidClip {
                    index,
                    start: clip.start_time,
                    end: clip.end_time,
                });
            }
        }
        for caption in &self.captions {
            caption
                .style
                .validate()
                .map_err(|source| RequestError::InvalidStyle {
                    id: caption.id.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Timing faults across all captions.
    pub fn caption_faults(&self) -> Vec<CaptionError> {
        self.captions
            .iter()
            .filter_map(|c| c.validate().err())
            .collect()
    }
}

/// Structural request error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("video path is missing")]
    MissingVideoPath,

    #[error("output path is missing")]
    MissingOutputPath,

    #[error("framerate out of range: {0}")]
    InvalidFramerate(f64),

    #[error("clip {index} has start {start}ms not before end {end}ms")]
    InvalidClip { index: usize, start: u64, end: u64 },

    #[error("caption {id} has invalid style: {source}")]
    InvalidStyle {
        id: String,
        #[source]
        source: StyleError,
    },
}
