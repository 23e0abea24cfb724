//! Tunables for a render pass.

use std::path::PathBuf;

use capburn_models::HwAccel;

use crate::timeline::DEFAULT_MIN_CAPTION_MS;

/// Graphs longer than this are written to a `-filter_complex_script` file.
pub const DEFAULT_MAX_FILTER_ARG_BYTES: usize = 24 * 1024;

/// Settings controlling planning, batching and engine invocation.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Window length for fixed chunking (seconds)
    pub chunk_secs: f64,
    /// Window length for smart chunking before merging (seconds)
    pub smart_window_secs: f64,
    /// Merge caption-free windows and stream-copy them
    pub smart_chunking: bool,
    /// Maximum overlay images composited by one engine invocation
    pub max_overlays_per_batch: usize,
    /// Maximum filter graph length passed on the command line
    pub max_filter_arg_bytes: usize,
    /// Pull-back applied to a word's end when the next word starts at the same instant (seconds)
    pub boundary_epsilon_secs: f64,
    /// Offset added per overlay index to enable windows (seconds)
    pub index_epsilon_secs: f64,
    /// Captions shorter than this after remapping are dropped
    pub min_caption_ms: u64,
    /// Share of logical cores used by the overlay pool
    pub pool_cpu_fraction: f64,
    /// Memory budget per overlay worker
    pub pool_worker_memory_bytes: u64,
    /// Upper bound on overlay workers
    pub pool_max_workers: usize,
    /// Jobs with fewer overlays than this render on the calling task
    pub pool_inline_threshold: usize,
    /// Encoder backends to probe, in order
    pub hw_preference: Vec<HwAccel>,
    /// Allow hardware encoders for overlay compositing
    pub hw_compositing: bool,
    /// Kill an engine invocation after this many seconds
    pub engine_timeout_secs: Option<u64>,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Extra directory searched before the system font directories
    pub font_dir: Option<PathBuf>,
    /// Family used when a caption's family cannot be resolved
    pub default_font_family: String,
    /// Parent directory for job temp directories; system temp when unset
    pub temp_root: Option<PathBuf>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            chunk_secs: 60.0,
            smart_window_secs: 10.0,
            smart_chunking: true,
            max_overlays_per_batch: 32,
            max_filter_arg_bytes: DEFAULT_MAX_FILTER_ARG_BYTES,
            boundary_epsilon_secs: 1e-6,
            index_epsilon_secs: 1e-6,
            min_caption_ms: DEFAULT_MIN_CAPTION_MS,
            pool_cpu_fraction: 0.75,
            pool_worker_memory_bytes: 150 * 1024 * 1024,
            pool_max_workers: 8,
            pool_inline_threshold: 8,
            hw_preference: default_hw_preference(),
            hw_compositing: false,
            engine_timeout_secs: Some(3600),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            font_dir: None,
            default_font_family: "DejaVu Sans".to_string(),
            temp_root: None,
        }
    }
}

impl RenderSettings {
    /// Clamp values that would stall planning or batching.
    pub fn normalized(mut self) -> Self {
        if self.chunk_secs.is_nan() || self.chunk_secs <= 0.0 {
            self.chunk_secs = 60.0;
        }
        if self.smart_window_secs.is_nan() || self.smart_window_secs <= 0.0 {
            self.smart_window_secs = 10.0;
        }
        self.max_overlays_per_batch = self.max_overlays_per_batch.max(1);
        self.pool_max_workers = self.pool_max_workers.max(1);
        self.boundary_epsilon_secs = self.boundary_epsilon_secs.abs();
        self.index_epsilon_secs = self.index_epsilon_secs.abs();
        self
    }
}

/// Platform-specific hardware encoder order.
pub fn default_hw_preference() -> Vec<HwAccel> {
    if cfg!(target_os = "macos") {
        vec![HwAccel::VideoToolbox]
    } else if cfg!(target_os = "windows") {
        vec![HwAccel::Nvenc, HwAccel::Qsv, HwAccel::Amf]
    } else {
        vec![HwAccel::Nvenc, HwAccel::Vaapi, HwAccel::Qsv]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RenderSettings::default();
        assert_eq!(settings.max_overlays_per_batch, 32);
        assert_eq!(settings.min_caption_ms, 100);
        assert!(!settings.hw_compositing);
        assert!(!settings.hw_preference.is_empty());
    }

    #[test]
    fn test_normalized_repairs_zero_values() {
        let settings = RenderSettings {
            chunk_secs: 0.0,
            max_overlays_per_batch: 0,
            boundary_epsilon_secs: -1e-6,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.chunk_secs, 60.0);
        assert_eq!(settings.max_overlays_per_batch, 1);
        assert!(settings.boundary_epsilon_secs > 0.0);
    }
}
