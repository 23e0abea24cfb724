//! Rasterization of one overlay spec into a transparent frame-sized image.
//!
//! Everything here is a pure function of the spec, the fonts and the frame
//! size, so the pool and the inline path share it unchanged.

use std::path::Path;
use std::sync::Arc;

use fontdue::Font;
use image::{ImageFormat, RgbaImage};

use capburn_models::{CaptionStyle, HighlightMode, RenderMode, Rgba, TextAlign};

use super::font::FontBook;
use super::OverlaySpec;
use crate::error::MediaResult;

/// Render a spec and write it as PNG.
pub fn write_overlay(
    spec: &OverlaySpec,
    fonts: &FontBook,
    width: u32,
    height: u32,
    path: &Path,
) -> MediaResult<()> {
    let image = render_overlay(spec, fonts, width, height)?;
    image.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

/// Per-word layout result.
#[derive(Debug, Clone)]
struct PlacedWord {
    index: usize,
    x: f32,
    width: f32,
    line: usize,
    px: f32,
    emphasized: bool,
}

#[derive(Debug, Clone, Default)]
struct Line {
    words: Vec<usize>,
    width: f32,
    top: f32,
    baseline: f32,
    height: f32,
}

/// A rasterized glyph at its frame position.
struct GlyphDraw {
    x: i32,
    y: i32,
    width: usize,
    height: usize,
    coverage: Vec<u8>,
    color: Rgba,
}

/// Render one overlay state.
pub fn render_overlay(
    spec: &OverlaySpec,
    fonts: &FontBook,
    width: u32,
    height: u32,
) -> MediaResult<RgbaImage> {
    let style = &spec.style;
    let mut image = RgbaImage::new(width.max(1), height.max(1));

    let scale = CaptionStyle::scale_for_height(height);
    let base_px = (style.font_size * scale).max(1.0);
    let stroke_px = (style.stroke_width * scale).max(0.0);
    let padding = (style.background_padding * scale).max(0.0);

    let emphasis = style.highlight_mode == HighlightMode::Emphasis && spec.active_word.is_some();
    let regular = fonts.resolve(&style.font_family, false)?;
    let bold = if emphasis {
        fonts.resolve(&style.font_family, true)?
    } else {
        Arc::clone(&regular)
    };

    let text_color = Rgba::parse_or(&style.text_color, Rgba::WHITE);
    let stroke_color = Rgba::parse_or(&style.stroke_color, Rgba([0, 0, 0, 255]));
    let highlight_color = Rgba::parse_or(&style.highlight_color, Rgba([255, 212, 0, 255]));
    let background = style
        .background_color
        .as_deref()
        .map(|c| Rgba::parse_or(c, Rgba::TRANSPARENT))
        .filter(|c| c.alpha() > 0);

    // Measure
    let mut placed: Vec<PlacedWord> = spec
        .words
        .iter()
        .enumerate()
        .map(|(index, word)| {
            let emphasized = emphasis && spec.active_word == Some(index);
            let (font, px) = if emphasized {
                (&bold, base_px * style.emphasis_scale.max(0.1))
            } else {
                (&regular, base_px)
            };
            PlacedWord {
                index,
                x: 0.0,
                width: measure(font, word, px),
                line: 0,
                px,
                emphasized,
            }
        })
        .collect();

    let space = regular.metrics(' ', base_px).advance_width;
    let max_width = (width as f32 * style.max_width_pct / 100.0).max(base_px);
    let mut lines = wrap(&mut placed, &spec.line_breaks, space, max_width);

    // Vertical metrics
    let (ascent, descent) = regular
        .horizontal_line_metrics(base_px)
        .map(|m| (m.ascent, m.descent))
        .unwrap_or((base_px * 0.8, -base_px * 0.2));
    let line_gap = (style.line_spacing - 1.0).max(0.0) * (ascent - descent);

    let mut cursor = 0.0;
    for line in lines.iter_mut() {
        let line_scale = line
            .words
            .iter()
            .map(|&i| placed[i].px / base_px)
            .fold(1.0f32, f32::max);
        line.top = cursor;
        line.baseline = cursor + ascent * line_scale;
        line.height = (ascent - descent) * line_scale;
        cursor += line.height + line_gap;
    }
    let block_height = (cursor - line_gap).max(0.0);
    let block_width = lines.iter().map(|l| l.width).fold(0.0f32, f32::max);

    // Position the block, keeping it inside the frame when it fits
    let center_x = width as f32 * style.position_x_pct / 100.0;
    let center_y = height as f32 * style.position_y_pct / 100.0;
    let left = clamp_span(center_x - block_width / 2.0, block_width, padding, width as f32);
    let top = clamp_span(center_y - block_height / 2.0, block_height, padding, height as f32);

    for line in lines.iter_mut() {
        let line_left = match style.align {
            TextAlign::Left => left,
            TextAlign::Center => left + (block_width - line.width) / 2.0,
            TextAlign::Right => left + block_width - line.width,
        };
        for &i in &line.words {
            placed[i].x += line_left;
        }
        line.top += top;
        line.baseline += top;
    }

    if let Some(background) = background {
        fill_rect(
            &mut image,
            left - padding,
            top - padding,
            block_width + 2.0 * padding,
            block_height + 2.0 * padding,
            background,
        );
    }

    if style.highlight_mode == HighlightMode::Box {
        if let Some(active) = spec.active_word.and_then(|i| placed.get(i)) {
            let line = &lines[active.line];
            let pad = (padding / 2.0).max(2.0);
            fill_rect(
                &mut image,
                active.x - pad,
                line.top - pad / 2.0,
                active.width + 2.0 * pad,
                line.height + pad,
                highlight_color,
            );
        }
    }

    // Rasterize visible words
    let mut glyphs = Vec::new();
    for word in &placed {
        let visible = match (style.render_mode, spec.active_word) {
            (RenderMode::Progressive, Some(active)) => word.index <= active,
            _ => true,
        };
        if !visible {
            continue;
        }
        let font = if word.emphasized { &bold } else { &regular };
        let color = if word.emphasized { highlight_color } else { text_color };
        let baseline = lines[word.line].baseline;
        rasterize_word(font, &spec.words[word.index], word.px, word.x, baseline, color, &mut glyphs);
    }

    if stroke_px >= 0.5 && stroke_color.alpha() > 0 {
        let radius = stroke_px.round() as i32;
        for glyph in &glyphs {
            draw_stroke(&mut image, glyph, radius, stroke_color);
        }
    }
    for glyph in &glyphs {
        draw_coverage(&mut image, glyph.x, glyph.y, glyph.width, glyph.height, &glyph.coverage, glyph.color);
    }

    Ok(image)
}

/// Advance width of a word including kerning.
fn measure(font: &Font, word: &str, px: f32) -> f32 {
    let mut width = 0.0;
    let mut previous = None;
    for ch in word.chars() {
        if let Some(prev) = previous {
            width += font.horizontal_kern(prev, ch, px).unwrap_or(0.0);
        }
        width += font.metrics(ch, px).advance_width;
        previous = Some(ch);
    }
    width
}

/// Greedy line breaking. Word `x` values are set relative to the line start.
fn wrap(placed: &mut [PlacedWord], hard_breaks: &[usize], space: f32, max_width: f32) -> Vec<Line> {
    let mut lines: Vec<Line> = vec![Line::default()];

    for i in 0..placed.len() {
        let forced = hard_breaks.contains(&i);
        let current = lines.len() - 1;
        let line = &lines[current];
        let needed = if line.words.is_empty() {
            placed[i].width
        } else {
            line.width + space + placed[i].width
        };

        if !line.words.is_empty() && (forced || needed > max_width) {
            lines.push(Line::default());
        }

        let current = lines.len() - 1;
        let line = &mut lines[current];
        let x = if line.words.is_empty() {
            0.0
        } else {
            line.width + space
        };
        placed[i].x = x;
        placed[i].line = current;
        line.width = x + placed[i].width;
        line.words.push(i);
    }

    lines
}

fn clamp_span(start: f32, size: f32, margin: f32, limit: f32) -> f32 {
    if size + 2.0 * margin >= limit {
        return start;
    }
    start.clamp(margin, limit - size - margin)
}

fn rasterize_word(
    font: &Font,
    word: &str,
    px: f32,
    x: f32,
    baseline: f32,
    color: Rgba,
    out: &mut Vec<GlyphDraw>,
) {
    let mut pen = x;
    let mut previous = None;
    for ch in word.chars() {
        if let Some(prev) = previous {
            pen += font.horizontal_kern(prev, ch, px).unwrap_or(0.0);
        }
        let (metrics, coverage) = font.rasterize(ch, px);
        if metrics.width > 0 && metrics.height > 0 {
            out.push(GlyphDraw {
                x: (pen + metrics.xmin as f32).round() as i32,
                y: (baseline - metrics.ymin as f32 - metrics.height as f32).round() as i32,
                width: metrics.width,
                height: metrics.height,
                coverage,
                color,
            });
        }
        pen += metrics.advance_width;
        previous = Some(ch);
    }
}

/// Dilate the glyph coverage by `radius` and paint it once.
fn draw_stroke(image: &mut RgbaImage, glyph: &GlyphDraw, radius: i32, color: Rgba) {
    let r = radius.max(1);
    let w = glyph.width + 2 * r as usize;
    let h = glyph.height + 2 * r as usize;
    let mut mask = vec![0u8; w * h];
    let limit = (r * r) + r;

    for gy in 0..glyph.height {
        for gx in 0..glyph.width {
            let c = glyph.coverage[gy * glyph.width + gx];
            if c == 0 {
                continue;
            }
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx * dx + dy * dy > limit {
                        continue;
                    }
                    let mx = (gx as i32 + r + dx) as usize;
                    let my = (gy as i32 + r + dy) as usize;
                    let slot = &mut mask[my * w + mx];
                    *slot = (*slot).max(c);
                }
            }
        }
    }

    draw_coverage(image, glyph.x - r, glyph.y - r, w, h, &mask, color);
}

fn draw_coverage(
    image: &mut RgbaImage,
    x: i32,
    y: i32,
    width: usize,
    height: usize,
    coverage: &[u8],
    color: Rgba,
) {
    for row in 0..height {
        for col in 0..width {
            let c = coverage[row * width + col];
            if c > 0 {
                blend(image, x + col as i32, y + row as i32, color, c);
            }
        }
    }
}

fn fill_rect(image: &mut RgbaImage, x: f32, y: f32, w: f32, h: f32, color: Rgba) {
    let x0 = x.round().max(0.0) as i32;
    let y0 = y.round().max(0.0) as i32;
    let x1 = (x + w).round().min(image.width() as f32) as i32;
    let y1 = (y + h).round().min(image.height() as f32) as i32;
    for py in y0..y1 {
        for px in x0..x1 {
            blend(image, px, py, color, 255);
        }
    }
}

/// Source-over compositing of `color` scaled by `coverage`.
fn blend(image: &mut RgbaImage, x: i32, y: i32, color: Rgba, coverage: u8) {
    if x < 0 || y < 0 || x as u32 >= image.width() || y as u32 >= image.height() {
        return;
    }
    let src_a = color.alpha() as f32 / 255.0 * coverage as f32 / 255.0;
    if src_a <= 0.0 {
        return;
    }
    let dst = image.get_pixel_mut(x as u32, y as u32);
    let dst_a = dst.0[3] as f32 / 255.0;
    let out_a = src_a + dst_a * (1.0 - src_a);
    if out_a <= 0.0 {
        return;
    }
    for channel in 0..3 {
        let s = color.0[channel] as f32;
        let d = dst.0[channel] as f32;
        dst.0[channel] = ((s * src_a + d * dst_a * (1.0 - src_a)) / out_a).round() as u8;
    }
    dst.0[3] = (out_a * 255.0).round() as u8;
}
