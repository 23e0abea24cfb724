//! Caption overlay images.
//!
//! Planning turns effective-timeline captions into [`OverlaySpec`]s, one per
//! visible caption state. Rendering rasterizes a spec into a transparent
//! frame-sized PNG, either inline or across the worker pool.

pub mod font;
pub mod pool;
pub mod render;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use capburn_models::{CaptionSegment, CaptionStyle};

pub use font::FontBook;
pub use pool::{pool_size, render_overlays, OverlayPoolConfig};
pub use render::{render_overlay, write_overlay};

/// Two word boundaries closer than this are treated as the same instant.
const BOUNDARY_TIE_SECS: f64 = 0.001;

/// One visible caption state to rasterize.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySpec {
    /// Position of the caption in the effective caption list
    pub caption_index: usize,
    /// Highlighted word, `None` for a static caption image
    pub active_word: Option<usize>,
    /// Display words after the caption's text transform
    pub words: Vec<String>,
    /// Indices of words that start a new line
    pub line_breaks: Vec<usize>,
    pub style: CaptionStyle,
    /// Enable window on the effective timeline (seconds)
    pub start_secs: f64,
    pub end_secs: f64,
}

impl OverlaySpec {
    /// File name unique across batches, captions and words.
    pub fn file_name(&self, batch: usize) -> String {
        match self.active_word {
            Some(word) => format!(
                "overlay_b{:03}_c{:05}_w{:04}.png",
                batch, self.caption_index, word
            ),
            None => format!("overlay_b{:03}_c{:05}_static.png", batch, self.caption_index),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }
}

/// A rendered overlay image and its enable window.
///
/// Times are absolute on the effective timeline until the planner rebases
/// them onto a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayArtifact {
    pub path: PathBuf,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl OverlayArtifact {
    pub fn new(path: impl Into<PathBuf>, start_secs: f64, end_secs: f64) -> Self {
        Self {
            path: path.into(),
            start_secs,
            end_secs,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }

    /// Whether the enable window intersects `[start, end)`.
    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        self.start_secs < end && self.end_secs > start
    }
}

/// Split caption text into display words and hard line breaks.
fn display_words(caption: &CaptionSegment) -> (Vec<String>, Vec<usize>) {
    let transform = caption.style.text_transform;
    let mut words = Vec::new();
    let mut breaks = Vec::new();

    match caption.word_timings() {
        Some(timings) => {
            for timing in timings {
                words.push(transform.apply(timing.word.trim()));
            }
        }
        None => {
            for (line_index, line) in caption.text.lines().enumerate() {
                let before = words.len();
                words.extend(line.split_whitespace().map(|w| transform.apply(w)));
                if line_index > 0 && words.len() > before {
                    breaks.push(before);
                }
            }
        }
    }
    (words, breaks)
}

/// Plan the overlay images for a set of captions.
///
/// Word-timed captions get one spec per word. A word stays highlighted until
/// the next word starts; the first word starts with the caption and the last
/// ends with it. When the next word starts at the current word's end, the
/// end is pulled back by `boundary_epsilon_secs` so the engine's inclusive
/// `between` never enables two overlays at the same instant.
///
/// Captions that are not burned in produce nothing.
pub fn plan_overlays(captions: &[CaptionSegment], boundary_epsilon_secs: f64) -> Vec<OverlaySpec> {
    let mut specs = Vec::new();

    for (caption_index, caption) in captions.iter().enumerate() {
        if !caption.is_burned_in() {
            continue;
        }
        let (words, line_breaks) = display_words(caption);
        if words.iter().all(|w| w.is_empty()) {
            continue;
        }

        let caption_start = caption.start_time_ms as f64 / 1000.0;
        let caption_end = caption.end_time_ms as f64 / 1000.0;

        let Some(timings) = caption.word_timings() else {
            specs.push(OverlaySpec {
                caption_index,
                active_word: None,
                words,
                line_breaks,
                style: caption.style.clone(),
                start_secs: caption_start,
                end_secs: caption_end,
            });
            continue;
        };

        for (index, timing) in timings.iter().enumerate() {
            let next_start = timings
                .get(index + 1)
                .map(|next| (next.start_ms as f64 / 1000.0).min(caption_end));

            let start = if index == 0 {
                caption_start
            } else {
                (timing.start_ms as f64 / 1000.0).clamp(caption_start, caption_end)
            };
            let mut end = next_start.unwrap_or(caption_end);
            if let Some(next_start) = next_start {
                if next_start - end <= BOUNDARY_TIE_SECS {
                    end = next_start - boundary_epsilon_secs;
                }
            }

            if end <= start {
                continue;
            }

            specs.push(OverlaySpec {
                caption_index,
                active_word: Some(index),
                words: words.clone(),
                line_breaks: line_breaks.clone(),
                style: caption.style.clone(),
                start_secs: start,
                end_secs: end,
            });
        }
    }

    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use capburn_models::{TextTransform, WordTiming};

    const EPS: f64 = 1e-6;

    fn karaoke_caption() -> CaptionSegment {
        CaptionSegment::new("k", 1_000, 4_000, "one two three").with_words(vec![
            WordTiming::new("one", 1_000, 2_000),
            WordTiming::new("two", 2_000, 2_500),
            WordTiming::new("three", 3_000, 4_000),
        ])
    }

    #[test]
    fn test_static_caption_gives_one_spec() {
        let captions = vec![
            CaptionSegment::new("a", 0, 5_000, "hello world"),
            CaptionSegment::new("b", 5_000, 10_000, "second line"),
        ];
        let specs = plan_overlays(&captions, EPS);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].active_word, None);
        assert_eq!(specs[0].words, vec!["hello", "world"]);
        assert_eq!((specs[1].start_secs, specs[1].end_secs), (5.0, 10.0));
    }

    #[test]
    fn test_word_windows_never_overlap() {
        let specs = plan_overlays(&[karaoke_caption()], EPS);
        assert_eq!(specs.len(), 3);
        for pair in specs.windows(2) {
            assert!(pair[0].end_secs < pair[1].start_secs);
            assert!(pair[1].start_secs - pair[0].end_secs <= EPS + 1e-12);
        }
        assert_eq!(specs[0].start_secs, 1.0);
        assert_eq!(specs[2].end_secs, 4.0);
    }

    #[test]
    fn test_not_burned_in_is_skipped() {
        let mut caption = CaptionSegment::new("x", 0, 1_000, "hidden");
        caption.style.burn_in = false;
        assert!(plan_overlays(&[caption], EPS).is_empty());
    }

    #[test]
    fn test_text_transform_and_line_breaks() {
        let mut caption = CaptionSegment::new("t", 0, 1_000, "first line\nsecond");
        caption.style.text_transform = TextTransform::Upper;
        let specs = plan_overlays(&[caption], EPS);
        assert_eq!(specs[0].words, vec!["FIRST", "LINE", "SECOND"]);
        assert_eq!(specs[0].line_breaks, vec![2]);
    }

    #[test]
    fn test_file_names_are_unique() {
        let specs = plan_overlays(&[karaoke_caption(), karaoke_caption()], EPS);
        let mut names: Vec<String> = specs.iter().map(|s| s.file_name(0)).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), specs.len());
        assert_ne!(specs[0].file_name(0), specs[0].file_name(1));
    }
}
