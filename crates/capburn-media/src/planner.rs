//! Partitioning of the effective timeline into units of engine work.

use serde::Serialize;

use crate::overlay::OverlayArtifact;

/// One unit of engine work.
///
/// `overlays` are relative to `start_secs` and clamped to the chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub start_secs: f64,
    pub end_secs: f64,
    pub has_captions: bool,
    pub overlays: Vec<OverlayArtifact>,
}

impl Chunk {
    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }
}

/// Chunking policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ChunkPolicy {
    /// Equal windows of about `window_secs`
    Fixed { window_secs: f64 },
    /// Small windows with caption-free runs merged
    Smart { window_secs: f64 },
}

/// Split `[0, total_secs)` into equal windows no longer than `window_secs`.
///
/// Each window starts exactly where the previous one ended and the last
/// ends exactly at `total_secs`.
pub fn fixed_windows(total_secs: f64, window_secs: f64) -> Vec<(f64, f64)> {
    if total_secs <= 0.0 {
        return Vec::new();
    }
    let window = if window_secs > 0.0 { window_secs } else { total_secs };
    let count = (total_secs / window).ceil().max(1.0) as usize;

    let mut windows = Vec::with_capacity(count);
    let mut start = 0.0;
    for i in 0..count {
        let end = if i + 1 == count {
            total_secs
        } else {
            total_secs * (i + 1) as f64 / count as f64
        };
        windows.push((start, end));
        start = end;
    }
    windows
}

/// Overlays intersecting `[start, end)`, rebased onto `start` and clamped.
pub fn rebase_overlays(overlays: &[OverlayArtifact], start: f64, end: f64) -> Vec<OverlayArtifact> {
    let duration = end - start;
    overlays
        .iter()
        .filter(|o| o.overlaps(start, end))
        .filter_map(|o| {
            let relative_start = (o.start_secs - start).clamp(0.0, duration);
            let relative_end = (o.end_secs - start).clamp(0.0, duration);
            (relative_end > relative_start)
                .then(|| OverlayArtifact::new(o.path.clone(), relative_start, relative_end))
        })
        .collect()
}

fn chunk_from_window(index: usize, start: f64, end: f64, overlays: &[OverlayArtifact]) -> Chunk {
    let overlays = rebase_overlays(overlays, start, end);
    Chunk {
        index,
        start_secs: start,
        end_secs: end,
        has_captions: !overlays.is_empty(),
        overlays,
    }
}

/// Fixed chunking: every window becomes its own chunk.
pub fn plan_fixed(total_secs: f64, window_secs: f64, overlays: &[OverlayArtifact]) -> Vec<Chunk> {
    fixed_windows(total_secs, window_secs)
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| chunk_from_window(index, start, end, overlays))
        .collect()
}

/// Smart chunking: consecutive caption-free windows merge into one chunk.
/// Caption-bearing windows are never merged.
pub fn plan_smart(total_secs: f64, window_secs: f64, overlays: &[OverlayArtifact]) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();

    for (start, end) in fixed_windows(total_secs, window_secs) {
        let has_captions = overlays.iter().any(|o| o.overlaps(start, end));
        if !has_captions {
            if let Some(previous) = chunks.last_mut().filter(|c| !c.has_captions) {
                previous.end_secs = end;
                continue;
            }
        }
        let index = chunks.len();
        chunks.push(chunk_from_window(index, start, end, overlays));
    }

    chunks
}

/// Plan chunks under `policy`.
pub fn plan_chunks(policy: ChunkPolicy, total_secs: f64, overlays: &[OverlayArtifact]) -> Vec<Chunk> {
    match policy {
        ChunkPolicy::Fixed { window_secs } => plan_fixed(total_secs, window_secs, overlays),
        ChunkPolicy::Smart { window_secs } => plan_smart(total_secs, window_secs, overlays),
    }
}

/// A time slice of a chunk small enough for one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubUnit {
    /// Offset from the chunk start
    pub start_secs: f64,
    pub end_secs: f64,
    /// Relative to the sub-unit start
    pub overlays: Vec<OverlayArtifact>,
}

/// Cut `[0, duration)` at overlay start times so that each slice carries at
/// most `max_overlays` overlays where the timing allows it.
///
/// Overlays straddling a cut appear, clipped, in both slices. A single
/// instant covered by more than `max_overlays` overlays cannot be cut
/// further; such slices exceed the limit and the caller layers them.
pub fn split_by_time(duration: f64, overlays: &[OverlayArtifact], max_overlays: usize) -> Vec<SubUnit> {
    let max_overlays = max_overlays.max(1);
    if overlays.len() <= max_overlays {
        return vec![SubUnit {
            start_secs: 0.0,
            end_secs: duration,
            overlays: overlays.to_vec(),
        }];
    }

    let mut sorted: Vec<&OverlayArtifact> = overlays.iter().collect();
    sorted.sort_by(|a, b| a.start_secs.total_cmp(&b.start_secs));

    let mut cuts = vec![0.0];
    let mut current_start = 0.0;
    for candidate in sorted.iter().map(|o| o.start_secs) {
        if candidate <= current_start || candidate >= duration {
            continue;
        }
        let in_slice = overlays
            .iter()
            .filter(|o| o.overlaps(current_start, candidate))
            .count();
        if in_slice >= max_overlays {
            cuts.push(candidate);
            current_start = candidate;
        }
    }
    cuts.push(duration);
    cuts.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);

    cuts.windows(2)
        .map(|w| SubUnit {
            start_secs: w[0],
            end_secs: w[1],
            overlays: rebase_overlays(overlays, w[0], w[1]),
        })
        .filter(|u| u.end_secs > u.start_secs)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(start: f64, end: f64) -> OverlayArtifact {
        OverlayArtifact::new(format!("o_{}.png", start), start, end)
    }

    fn assert_covers(chunks: &[Chunk], total: f64) {
        assert_eq!(chunks.first().unwrap().start_secs, 0.0);
        assert_eq!(chunks.last().unwrap().end_secs, total);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_secs, pair[1].start_secs);
        }
    }

    #[test]
    fn test_fixed_windows_cover_exactly() {
        for (total, window) in [(10.0, 3.0), (59.97, 10.0), (0.5, 60.0), (120.0, 60.0), (7.3, 0.9)] {
            let windows = fixed_windows(total, window);
            assert_eq!(windows[0].0, 0.0);
            assert_eq!(windows.last().unwrap().1, total);
            for pair in windows.windows(2) {
                assert_eq!(pair[0].1, pair[1].0);
            }
            assert!(windows.iter().all(|(s, e)| e > s && e - s <= window + 1e-9));
        }
        assert!(fixed_windows(0.0, 10.0).is_empty());
    }

    #[test]
    fn test_fixed_plan_covers_and_rebases() {
        let chunks = plan_fixed(30.0, 10.0, &[overlay(9.0, 12.0)]);
        assert_eq!(chunks.len(), 3);
        assert_covers(&chunks, 30.0);
        assert_eq!(chunks[0].overlays[0].start_secs, 9.0);
        assert_eq!(chunks[0].overlays[0].end_secs, 10.0);
        assert_eq!(chunks[1].overlays[0].start_secs, 0.0);
        assert_eq!(chunks[1].overlays[0].end_secs, 2.0);
        assert!(!chunks[2].has_captions);
    }

    #[test]
    fn test_smart_merges_caption_free_runs() {
        // Captions only in windows 2 and 3 of six
        let overlays = [overlay(21.0, 24.0), overlay(31.0, 33.0)];
        let chunks = plan_smart(60.0, 10.0, &overlays);

        assert_covers(&chunks, 60.0);
        let shape: Vec<(f64, f64, bool)> = chunks
            .iter()
            .map(|c| (c.start_secs, c.end_secs, c.has_captions))
            .collect();
        assert_eq!(
            shape,
            vec![
                (0.0, 20.0, false),
                (20.0, 30.0, true),
                (30.0, 40.0, true),
                (40.0, 60.0, false),
            ]
        );
        for pair in chunks.windows(2) {
            assert!(pair[0].has_captions || pair[1].has_captions);
        }
        assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn test_smart_without_captions_is_one_chunk() {
        let chunks = plan_smart(95.0, 10.0, &[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start_secs, chunks[0].end_secs), (0.0, 95.0));
    }

    #[test]
    fn test_rebase_drops_zero_length() {
        let rebased = rebase_overlays(&[overlay(10.0, 12.0)], 0.0, 10.0);
        assert!(rebased.is_empty());
    }

    #[test]
    fn test_split_by_time_respects_limit() {
        let overlays: Vec<OverlayArtifact> = (0..10)
            .map(|i| overlay(i as f64, i as f64 + 0.999999))
            .collect();
        let units = split_by_time(10.0, &overlays, 3);

        assert_eq!(units.first().unwrap().start_secs, 0.0);
        assert_eq!(units.last().unwrap().end_secs, 10.0);
        for pair in units.windows(2) {
            assert_eq!(pair[0].end_secs, pair[1].start_secs);
        }
        assert!(units.iter().all(|u| u.overlays.len() <= 3));
        let total: usize = units.iter().map(|u| u.overlays.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_split_by_time_small_input_is_single_unit() {
        let units = split_by_time(5.0, &[overlay(0.0, 5.0)], 32);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].overlays.len(), 1);
    }
}
