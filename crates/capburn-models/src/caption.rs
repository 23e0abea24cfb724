//! Caption segments and per-word timing.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::style::CaptionStyle;

/// Timing of a single word inside a caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    /// Word text as spoken
    pub word: String,
    /// Start in milliseconds (source timeline)
    pub start_ms: u64,
    /// End in milliseconds (source timeline)
    pub end_ms: u64,
}

impl WordTiming {
    pub fn new(word: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            word: word.into(),
            start_ms,
            end_ms,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

pub type CaptionResult<T> = Result<T, CaptionError>;

/// A timed caption with its style and optional word-level timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaptionSegment {
    /// Caller-assigned identifier
    pub id: String,
    /// Start in milliseconds
    pub start_time_ms: u64,
    /// End in milliseconds (exclusive)
    pub end_time_ms: u64,
    /// Full caption text
    pub text: String,
    /// Visual style
    #[serde(default)]
    pub style: CaptionStyle,
    /// Word-level timing for karaoke/progressive highlighting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTiming>>,
}

impl CaptionSegment {
    /// Create a plain caption without word timing.
    pub fn new(id: impl Into<String>, start_time_ms: u64, end_time_ms: u64, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_time_ms,
            end_time_ms,
            text: text.into(),
            style: CaptionStyle::default(),
            words: None,
        }
    }

    /// Attach word timing.
    pub fn with_words(mut self, words: Vec<WordTiming>) -> Self {
        self.words = Some(words);
        self
    }

    /// Replace the style.
    pub fn with_style(mut self, style: CaptionStyle) -> Self {
        self.style = style;
        self
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms.saturating_sub(self.start_time_ms)
    }

    /// Word timings, if any are present and non-empty.
    pub fn word_timings(&self) -> Option<&[WordTiming]> {
        match self.words.as_deref() {
            Some(words) if !words.is_empty() => Some(words),
            _ => None,
        }
    }

    /// Whether this caption is composited onto the video at all.
    pub fn is_burned_in(&self) -> bool {
        self.style.burn_in
    }

    /// Check the caption's timing invariants.
    ///
    /// Word faults are reported individually so callers can drop the word
    /// rather than the whole caption.
    pub fn validate(&self) -> CaptionResult<()> {
        if self.start_time_ms >= self.end_time_ms {
            return Err(CaptionError::InvalidBounds {
                id: self.id.clone(),
                start_ms: self.start_time_ms,
                end_ms: self.end_time_ms,
            });
        }

        if let Some(words) = self.word_timings() {
            let mut previous_start = 0u64;
            for (index, word) in words.iter().enumerate() {
                if word.start_ms >= word.end_ms {
                    return Err(CaptionError::InvalidWord {
                        id: self.id.clone(),
                        index,
                        start_ms: word.start_ms,
                        end_ms: word.end_ms,
                    });
                }
                if word.start_ms < previous_start {
                    return Err(CaptionError::WordsOutOfOrder {
                        id: self.id.clone(),
                        index,
                    });
                }
                previous_start = word.start_ms;
            }
        }

        Ok(())
    }

    /// Drop words that violate timing invariants, keeping the caption.
    ///
    /// Returns the number of words removed.
    pub fn retain_valid_words(&mut self) -> usize {
        let Some(words) = self.words.as_mut() else {
            return 0;
        };
        let before = words.len();
        let mut last_start = 0u64;
        words.retain(|word| {
            let ok = word.start_ms < word.end_ms && word.start_ms >= last_start;
            if ok {
                last_start = word.start_ms;
            }
            ok
        });
        before - words.len()
    }
}

/// Caption timing faults detected at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptionError {
    #[error("caption {id}: start {start_ms}ms is not before end {end_ms}ms")]
    InvalidBounds { id: String, start_ms: u64, end_ms: u64 },

    #[error("caption {id}: word {index} has start {start_ms}ms not before end {end_ms}ms")]
    InvalidWord {
        id: String,
        index: usize,
        start_ms: u64,
        end_ms: u64,
    },

    #[error("caption {id}: word {index} starts before the previous word")]
    WordsOutOfOrder { id: String, index: usize },
}

impl CaptionError {
    /// Whether the fault concerns a single word rather than the caption bounds.
    pub fn is_word_fault(&self) -> bool {
        matches!(
            self,
            CaptionError::InvalidWord { .. } | CaptionError::WordsOutOfOrder { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bounds() {
        let caption = CaptionSegment::new("c1", 1000, 1000, "hello");
        assert!(matches!(
            caption.validate(),
            Err(CaptionError::InvalidBounds { .. })
        ));

        let caption = CaptionSegment::new("c1", 1000, 2000, "hello");
        assert!(caption.validate().is_ok());
    }

    #[test]
    fn test_validate_words() {
        let caption = CaptionSegment::new("c1", 0, 2000, "hello world").with_words(vec![
            WordTiming::new("hello", 0, 800),
            WordTiming::new("world", 900, 900),
        ]);
        let err = caption.validate().unwrap_err();
        assert!(err.is_word_fault());
        assert!(matches!(err, CaptionError::InvalidWord { index: 1, .. }));
    }

    #[test]
    fn test_words_out_of_order() {
        let caption = CaptionSegment::new("c1", 0, 2000, "a b").with_words(vec![
            WordTiming::new("a", 1000, 1500),
            WordTiming::new("b", 200, 600),
        ]);
        assert!(matches!(
            caption.validate(),
            Err(CaptionError::WordsOutOfOrder { index: 1, .. })
        ));
    }

    #[test]
    fn test_retain_valid_words() {
        let mut caption = CaptionSegment::new("c1", 0, 3000, "a b c").with_words(vec![
            WordTiming::new("a", 0, 500),
            WordTiming::new("b", 600, 600),
            WordTiming::new("c", 700, 1200),
        ]);
        assert_eq!(caption.retain_valid_words(), 1);
        assert_eq!(caption.word_timings().unwrap().len(), 2);
        assert!(caption.validate().is_ok());
    }

    #[test]
    fn test_empty_words_are_treated_as_plain() {
        let caption = CaptionSegment::new("c1", 0, 1000, "x").with_words(Vec::new());
        assert!(caption.word_timings().is_none());
    }

    #[test]
    fn test_camel_case_json() {
        let json = r#"{
            "id": "a",
            "startTimeMs": 0,
            "endTimeMs": 1500,
            "text": "hi there",
            "words": [{"word": "hi", "startMs": 0, "endMs": 700}]
        }"#;
        let caption: CaptionSegment = serde_json::from_str(json).unwrap();
        assert_eq!(caption.end_time_ms, 1500);
        assert_eq!(caption.word_timings().unwrap()[0].end_ms, 700);
        assert!(caption.is_burned_in());
    }
}
