//! Remapping of caption timestamps onto a clip-trimmed timeline.
//!
//! The effective timeline is the concatenation of every non-removed clip in
//! original-start order. Captions that fall entirely inside removed spans are
//! filtered; surviving captions and their words are shifted onto the
//! effective axis.

use serde::Serialize;
use tracing::debug;

use capburn_models::{CaptionSegment, VideoClip, WordTiming};

/// Captions shorter than this after remapping are dropped.
pub const DEFAULT_MIN_CAPTION_MS: u64 = 100;

/// One active clip placed on both the original and the effective axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSegment {
    pub original_start: u64,
    pub original_end: u64,
    pub effective_start: u64,
    pub effective_end: u64,
    pub index: usize,
}

impl TimelineSegment {
    pub fn duration_ms(&self) -> u64 {
        self.original_end - self.original_start
    }
}

/// Why a caption did not survive remapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Entirely inside removed spans
    Removed,
    /// Mapped bounds could not be resolved
    InvalidBounds,
    /// Mapped duration below the minimum
    TooShort { duration_ms: u64 },
}

/// A caption removed during remapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedCaption {
    pub id: String,
    pub reason: DropReason,
}

/// Output of [`TimelineMapper::map_captions`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MappedCaptions {
    pub captions: Vec<CaptionSegment>,
    pub dropped: Vec<DroppedCaption>,
    pub dropped_words: usize,
}

/// Maps original-timeline milliseconds onto the effective timeline.
#[derive(Debug, Clone)]
pub struct TimelineMapper {
    segments: Vec<TimelineSegment>,
    identity: bool,
}

impl TimelineMapper {
    /// Build the mapper from the trim editor's clip list.
    ///
    /// When no clip is marked removed the mapper is the identity.
    pub fn new(clips: &[VideoClip]) -> Self {
        let identity = !clips.iter().any(|c| c.is_removed);

        let mut active: Vec<&VideoClip> = clips.iter().filter(|c| c.is_active()).collect();
        active.sort_by_key(|c| c.start_time);

        let mut segments = Vec::with_capacity(active.len());
        let mut effective_offset = 0u64;
        let mut previous_end = 0u64;
        for clip in active {
            // Overlapping active clips would double-count content
            let original_start = clip.start_time.max(previous_end);
            if original_start >= clip.end_time {
                continue;
            }
            let duration = clip.end_time - original_start;
            segments.push(TimelineSegment {
                original_start,
                original_end: clip.end_time,
                effective_start: effective_offset,
                effective_end: effective_offset + duration,
                index: segments.len(),
            });
            effective_offset += duration;
            previous_end = clip.end_time;
        }

        Self { segments, identity }
    }

    /// Mapper that passes every timestamp through unchanged.
    pub fn identity() -> Self {
        Self {
            segments: Vec::new(),
            identity: true,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn segments(&self) -> &[TimelineSegment] {
        &self.segments
    }

    /// Total length of the effective timeline; `None` for the identity mapper.
    pub fn effective_duration_ms(&self) -> Option<u64> {
        if self.identity {
            return None;
        }
        Some(self.segments.last().map(|s| s.effective_end).unwrap_or(0))
    }

    /// Map an instant. `None` when the instant lies in no active segment.
    pub fn map_time(&self, original_ms: u64) -> Option<u64> {
        if self.identity {
            return Some(original_ms);
        }
        self.segments
            .iter()
            .find(|s| original_ms >= s.original_start && original_ms < s.original_end)
            .map(|s| s.effective_start + (original_ms - s.original_start))
    }

    /// Map an exclusive end instant; a segment's own end maps to its effective end.
    fn map_end(&self, original_ms: u64) -> Option<u64> {
        if self.identity {
            return Some(original_ms);
        }
        self.segments
            .iter()
            .find(|s| original_ms > s.original_start && original_ms <= s.original_end)
            .map(|s| s.effective_start + (original_ms - s.original_start))
    }

    /// True iff `[start_ms, end_ms)` overlaps no active segment.
    pub fn should_filter(&self, start_ms: u64, end_ms: u64) -> bool {
        if self.identity {
            return false;
        }
        !self
            .segments
            .iter()
            .any(|s| s.original_start < end_ms && s.original_end > start_ms)
    }

    /// Map a span, clamping each end to the first/last overlapping segment.
    pub fn map_range(&self, start_ms: u64, end_ms: u64) -> Option<(u64, u64)> {
        if self.identity {
            return (start_ms < end_ms).then_some((start_ms, end_ms));
        }
        let mut overlapping = self
            .segments
            .iter()
            .filter(|s| s.original_start < end_ms && s.original_end > start_ms);
        let first = overlapping.next()?;
        let last = overlapping.last().unwrap_or(first);

        let effective_start = first.effective_start + (start_ms.max(first.original_start) - first.original_start);
        let effective_end = last.effective_start + (end_ms.min(last.original_end) - last.original_start);

        (effective_start < effective_end).then_some((effective_start, effective_end))
    }

    /// Remap captions onto the effective timeline.
    pub fn map_captions(&self, captions: &[CaptionSegment], min_duration_ms: u64) -> MappedCaptions {
        if self.identity {
            return MappedCaptions {
                captions: captions.to_vec(),
                ..Default::default()
            };
        }

        let mut out = MappedCaptions::default();
        for caption in captions {
            if self.should_filter(caption.start_time_ms, caption.end_time_ms) {
                debug!(caption = %caption.id, "Caption lies in removed span, dropping");
                out.dropped.push(DroppedCaption {
                    id: caption.id.clone(),
                    reason: DropReason::Removed,
                });
                continue;
            }

            let Some((start, end)) = self.map_range(caption.start_time_ms, caption.end_time_ms)
            else {
                out.dropped.push(DroppedCaption {
                    id: caption.id.clone(),
                    reason: DropReason::InvalidBounds,
                });
                continue;
            };

            let duration_ms = end - start;
            if duration_ms < min_duration_ms {
                debug!(caption = %caption.id, duration_ms, "Remapped caption too short, dropping");
                out.dropped.push(DroppedCaption {
                    id: caption.id.clone(),
                    reason: DropReason::TooShort { duration_ms },
                });
                continue;
            }

            let words = caption.words.as_ref().map(|words| {
                let mapped: Vec<WordTiming> = words
                    .iter()
                    .filter_map(|w| {
                        let s = self.map_time(w.start_ms)?;
                        let e = self.map_end(w.end_ms)?;
                        (s < e).then(|| WordTiming::new(w.word.clone(), s, e))
                    })
                    .collect();
                out.dropped_words += words.len() - mapped.len();
                mapped
            });

            out.captions.push(CaptionSegment {
                start_time_ms: start,
                end_time_ms: end,
                words,
                ..caption.clone()
            });
        }
        out
    }
}
