//! Clip-trim edits over the source timeline.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A span of the original source video, optionally marked as removed.
///
/// Produced by the trim editor; the ordered non-removed clips define the
/// effective timeline that captions are remapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoClip {
    /// Start in milliseconds on the original timeline
    pub start_time: u64,
    /// End in milliseconds on the original timeline (exclusive)
    pub end_time: u64,
    /// Whether the span is cut from the output
    #[serde(default)]
    pub is_removed: bool,
}

impl VideoClip {
    pub fn new(start_time: u64, end_time: u64) -> Self {
        Self {
            start_time,
            end_time,
            is_removed: false,
        }
    }

    pub fn removed(start_time: u64, end_time: u64) -> Self {
        Self {
            start_time,
            end_time,
            is_removed: true,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    pub fn is_active(&self) -> bool {
        !self.is_removed && self.end_time > self.start_time
    }
}

/// Whether any clip in the list is marked removed.
pub fn has_removed_clips(clips: &[VideoClip]) -> bool {
    clips.iter().any(|c| c.is_removed)
}

/// Build a clip list that keeps everything except `removed` spans.
///
/// Convenience for callers that only know the cut spans; gaps between cuts
/// become active clips covering `[0, total_ms)`.
pub fn clips_from_removed_spans(total_ms: u64, removed: &[(u64, u64)]) -> Vec<VideoClip> {
    let mut spans: Vec<(u64, u64)> = removed
        .iter()
        .map(|&(s, e)| (s.min(total_ms), e.min(total_ms)))
        .filter(|(s, e)| e > s)
        .collect();
    spans.sort_by_key(|(s, _)| *s);

    let mut clips = Vec::new();
    let mut cursor = 0u64;
    for (start, end) in spans {
        if start > cursor {
            clips.push(VideoClip::new(cursor, start));
        }
        let start = start.max(cursor);
        if end > start {
            clips.push(VideoClip::removed(start, end));
        }
        cursor = cursor.max(end);
    }
    if cursor < total_ms {
        clips.push(VideoClip::new(cursor, total_ms));
    }
    clips
}
