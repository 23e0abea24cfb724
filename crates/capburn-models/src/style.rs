//! Caption visual style definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How the active word of a word-timed caption is highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HighlightMode {
    /// A coloured box slides behind the active word
    #[default]
    Box,
    /// The active word changes colour, weight and size; no background
    Emphasis,
}

/// Which words of a word-timed caption are visible at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// All words visible, active word highlighted
    #[default]
    Karaoke,
    /// Words revealed up to and including the active word
    Progressive,
}

/// Horizontal alignment of each text line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    Left,
    #[default]
    Center,
    Right,
}

/// Case transform applied before layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TextTransform {
    #[default]
    None,
    Upper,
    Lower,
    Capitalize,
}

impl TextTransform {
    /// Apply the transform to a piece of text.
    pub fn apply(&self, text: &str) -> String {
        match self {
            TextTransform::None => text.to_string(),
            TextTransform::Upper => text.to_uppercase(),
            TextTransform::Lower => text.to_lowercase(),
            TextTransform::Capitalize => text
                .split(' ')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Reference frame height that `font_size` and `stroke_width` are expressed against.
pub const REFERENCE_HEIGHT: u32 = 1080;

/// Caption style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptionStyle {
    /// Font family name, resolved against the font directories
    pub font_family: String,
    /// Font size in pixels at 1080p
    pub font_size: f32,
    /// Text colour (`#RRGGBB` or `#RRGGBBAA`)
    pub text_color: String,
    /// Outline colour
    pub stroke_color: String,
    /// Outline width in pixels at 1080p (0 disables)
    pub stroke_width: f32,
    /// Background box behind the whole caption
    pub background_color: Option<String>,
    /// Padding around the text inside the background box, pixels at 1080p
    pub background_padding: f32,
    /// Colour used for the active word
    pub highlight_color: String,
    /// Highlight rendering style
    pub highlight_mode: HighlightMode,
    /// Size multiplier for the active word in emphasis mode
    pub emphasis_scale: f32,
    /// Karaoke or progressive reveal
    pub render_mode: RenderMode,
    /// Horizontal centre of the text block, percent of frame width
    pub position_x_pct: f32,
    /// Vertical centre of the text block, percent of frame height
    pub position_y_pct: f32,
    /// Line alignment
    pub align: TextAlign,
    /// Case transform
    pub text_transform: TextTransform,
    /// Maximum line width, percent of frame width
    pub max_width_pct: f32,
    /// Line height multiplier
    pub line_spacing: f32,
    /// Whether the caption is composited into the video (false = export-only)
    pub burn_in: bool,
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            font_family: "DejaVu Sans".to_string(),
            font_size: 64.0,
            text_color: "#FFFFFF".to_string(),
            stroke_color: "#000000".to_string(),
            stroke_width: 3.0,
            background_color: None,
            background_padding: 16.0,
            highlight_color: "#FFD400".to_string(),
            highlight_mode: HighlightMode::Box,
            emphasis_scale: 1.15,
            render_mode: RenderMode::Karaoke,
            position_x_pct: 50.0,
            position_y_pct: 80.0,
            align: TextAlign::Center,
            text_transform: TextTransform::None,
            max_width_pct: 90.0,
            line_spacing: 1.2,
            burn_in: true,
        }
    }
}

impl CaptionStyle {
    /// Validate percentages and colours.
    pub fn validate(&self) -> Result<(), StyleError> {
        for (name, value) in [
            ("positionXPct", self.position_x_pct),
            ("positionYPct", self.position_y_pct),
            ("maxWidthPct", self.max_width_pct),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(StyleError::OutOfRange { field: name, value });
            }
        }
        if self.font_size.is_nan() || self.font_size <= 0.0 {
            return Err(StyleError::OutOfRange {
                field: "fontSize",
                value: self.font_size,
            });
        }
        if self.stroke_width < 0.0 {
            return Err(StyleError::OutOfRange {
                field: "strokeWidth",
                value: self.stroke_width,
            });
        }

        self.text_color.parse::<Rgba>()?;
        self.stroke_color.parse::<Rgba>()?;
        self.highlight_color.parse::<Rgba>()?;
        if let Some(background) = &self.background_color {
            background.parse::<Rgba>()?;
        }
        Ok(())
    }

    /// Scale factor from the 1080p reference to a frame of `height` pixels.
    pub fn scale_for_height(height: u32) -> f32 {
        height.max(1) as f32 / REFERENCE_HEIGHT as f32
    }
}

/// An RGBA colour parsed from a hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba([0, 0, 0, 0]);
    pub const WHITE: Rgba = Rgba([255, 255, 255, 255]);

    pub fn alpha(&self) -> u8 {
        self.0[3]
    }

    /// Parse, falling back to `fallback` on malformed input.
    pub fn parse_or(value: &str, fallback: Rgba) -> Rgba {
        value.parse().unwrap_or(fallback)
    }
}

impl FromStr for Rgba {
    type Err = StyleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let hex = value.trim().trim_start_matches('#');
        if !(hex.len() == 6 || hex.len() == 8) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StyleError::InvalidColor(value.to_string()));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| StyleError::InvalidColor(value.to_string()))
        };
        let alpha = if hex.len() == 8 { channel(6)? } else { 255 };
        Ok(Rgba([channel(0)?, channel(2)?, channel(4)?, alpha]))
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.0;
        write!(f, "#{:02X}{:02X}{:02X}{:02X}", r, g, b, a)
    }
}

/// Style validation error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StyleError {
    #[error("invalid colour: {0}")]
    InvalidColor(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color() {
        assert_eq!("#FF8000".parse::<Rgba>().unwrap(), Rgba([255, 128, 0, 255]));
        assert_eq!("00000080".parse::<Rgba>().unwrap(), Rgba([0, 0, 0, 128]));
        assert!("#FFF".parse::<Rgba>().is_err());
        assert!("#GGGGGG".parse::<Rgba>().is_err());
    }

    #[test]
    fn test_color_display() {
        assert_eq!(Rgba([1, 2, 3, 255]).to_string(), "#010203FF");
    }

    #[test]
    fn test_text_transform() {
        assert_eq!(TextTransform::Upper.apply("Hello world"), "HELLO WORLD");
        assert_eq!(TextTransform::Lower.apply("Hello World"), "hello world");
        assert_eq!(TextTransform::Capitalize.apply("hello big world"), "Hello Big World");
        assert_eq!(TextTransform::None.apply("as is"), "as is");
    }

    #[test]
    fn test_default_style_is_valid() {
        assert!(CaptionStyle::default().validate().is_ok());
    }

    #[test]
    fn test_style_rejects_bad_position() {
        let style = CaptionStyle {
            position_y_pct: 120.0,
            ..Default::default()
        };
        assert!(matches!(
            style.validate(),
            Err(StyleError::OutOfRange { field: "positionYPct", .. })
        ));
    }

    #[test]
    fn test_partial_style_json_uses_defaults() {
        let style: CaptionStyle =
            serde_json::from_str(r#"{"highlightMode": "emphasis", "burnIn": false}"#).unwrap();
        assert_eq!(style.highlight_mode, HighlightMode::Emphasis);
        assert!(!style.burn_in);
        assert_eq!(style.render_mode, RenderMode::Karaoke);
    }
}
