//! Overlay compositing filter graphs.
//!
//! Input 0 is the base video; inputs `1..=n` are the overlay images in the
//! order given. Each stage consumes the previous stage's label:
//!
//! ```text
//! [0:v][1:v]overlay=0:0:enable='between(t,S1,E1)'[v1];
//! [v1][2:v]overlay=0:0:enable='between(t,S2,E2)'[v2];
//! [v2]format=yuv420p[vout]
//! ```

use std::path::Path;

use capburn_models::encoding::OUTPUT_PIXEL_FORMAT;

use crate::command::format_secs;
use crate::error::MediaResult;
use crate::overlay::OverlayArtifact;

/// Label of the final composited video stream.
pub const OUTPUT_LABEL: &str = "vout";

/// How overlay inputs are fed into the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterStrategy {
    /// Overlay image streams are used directly
    #[default]
    Standard,
    /// Each overlay image is converted to RGBA before compositing.
    /// Used as the retry after an engine crash.
    AlphaFormat,
}

/// A built graph ready to hand to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGraph {
    pub graph: String,
    pub output_label: String,
    /// Number of overlay inputs after the base video
    pub overlay_inputs: usize,
}

impl FilterGraph {
    /// Whether the graph is too long to pass as a command-line argument.
    pub fn needs_script(&self, max_arg_bytes: usize) -> bool {
        self.graph.len() > max_arg_bytes
    }

    /// Write the graph to a `-filter_complex_script` file.
    pub async fn write_script(&self, path: &Path) -> MediaResult<()> {
        tokio::fs::write(path, self.graph.as_bytes()).await?;
        Ok(())
    }

    /// `-map` argument for the composited stream.
    pub fn map_label(&self) -> String {
        format!("[{}]", self.output_label)
    }
}

/// The enable window for the overlay at graph position `position`.
///
/// Both bounds move by `position * index_epsilon` so that overlays with
/// identical windows never share a boundary instant.
pub fn enable_window(overlay: &OverlayArtifact, position: usize, index_epsilon: f64) -> (f64, f64) {
    let offset = position as f64 * index_epsilon;
    (overlay.start_secs + offset, overlay.end_secs + offset)
}

/// Build a chained overlay graph for `overlays` (in input order).
pub fn build_overlay_graph(overlays: &[OverlayArtifact], index_epsilon: f64, strategy: FilterStrategy) -> FilterGraph {
    let mut stages: Vec<String> = Vec::with_capacity(overlays.len() * 2 + 1);
    let mut current = "0:v".to_string();

    for (position, overlay) in overlays.iter().enumerate() {
        let input = position + 1;
        let image = match strategy {
            FilterStrategy::Standard => format!("{}:v", input),
            FilterStrategy::AlphaFormat => {
                let label = format!("o{}", input);
                stages.push(format!("[{}:v]format=rgba[{}]", input, label));
                label
            }
        };
        let (start, end) = enable_window(overlay, position, index_epsilon);
        let next = format!("v{}", input);
        stages.push(format!(
            "[{}][{}]overlay=0:0:enable='between(t,{},{})'[{}]",
            current,
            image,
            format_secs(start),
            format_secs(end),
            next
        ));
        current = next;
    }

    stages.push(format!("[{}]format={}[{}]", current, OUTPUT_PIXEL_FORMAT, OUTPUT_LABEL));

    FilterGraph {
        graph: stages.join(";"),
        output_label: OUTPUT_LABEL.to_string(),
        overlay_inputs: overlays.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(name: &str, start: f64, end: f64) -> OverlayArtifact {
        OverlayArtifact::new(name, start, end)
    }

    #[test]
    fn test_chain_labels() {
        let graph = build_overlay_graph(
            &[overlay("a.png", 0.0, 5.0), overlay("b.png", 5.0, 10.0)],
            0.0,
            FilterStrategy::Standard,
        );
        assert_eq!(
            graph.graph,
            "[0:v][1:v]overlay=0:0:enable='between(t,0.000000,5.000000)'[v1];\
             [v1][2:v]overlay=0:0:enable='between(t,5.000000,10.000000)'[v2];\
             [v2]format=yuv420p[vout]"
        );
        assert_eq!(graph.overlay_inputs, 2);
        assert_eq!(graph.map_label(), "[vout]");
    }

    #[test]
    fn test_index_offset_separates_identical_windows() {
        let overlays = [overlay("a.png", 1.0, 2.0), overlay("b.png", 1.0, 2.0)];
        let first = enable_window(&overlays[0], 0, 1e-6);
        let second = enable_window(&overlays[1], 1, 1e-6);
        assert!(second.0 > first.0);
        assert!(second.1 > first.1);

        let graph = build_overlay_graph(&overlays, 1e-6, FilterStrategy::Standard);
        assert!(graph.graph.contains("between(t,1.000000,2.000000)"));
        assert!(graph.graph.contains("between(t,1.000001,2.000001)"));
    }

    #[test]
    fn test_alpha_format_strategy() {
        let graph = build_overlay_graph(&[overlay("a.png", 0.0, 1.0)], 0.0, FilterStrategy::AlphaFormat);
        assert!(graph.graph.starts_with("[1:v]format=rgba[o1];[0:v][o1]overlay"));
        assert!(graph.graph.ends_with("[v1]format=yuv420p[vout]"));
    }

    #[test]
    fn test_empty_graph_still_normalizes_format() {
        let graph = build_overlay_graph(&[], 1e-6, FilterStrategy::Standard);
        assert_eq!(graph.graph, "[0:v]format=yuv420p[vout]");
        assert_eq!(graph.overlay_inputs, 0);
    }

    #[test]
    fn test_needs_script_by_length() {
        let overlays: Vec<OverlayArtifact> = (0..400)
            .map(|i| overlay("x.png", i as f64, i as f64 + 1.0))
            .collect();
        let graph = build_overlay_graph(&overlays, 1e-6, FilterStrategy::Standard);
        assert!(graph.needs_script(24 * 1024));
        assert!(!build_overlay_graph(&overlays[..2], 1e-6, FilterStrategy::Standard).needs_script(24 * 1024));
    }

    #[tokio::test]
    async fn test_write_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.txt");
        let graph = build_overlay_graph(&[overlay("a.png", 0.0, 1.0)], 0.0, FilterStrategy::Standard);
        graph.write_script(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), graph.graph);
    }
}
