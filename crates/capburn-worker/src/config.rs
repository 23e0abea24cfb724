//! Worker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use capburn_media::RenderSettings;
use capburn_models::HwAccel;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parent directory for per-job temp directories
    pub work_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Extra font directory searched before the system ones
    pub font_dir: Option<PathBuf>,
    pub default_font_family: String,
    /// Fixed chunk length when smart chunking is off
    pub chunk_secs: f64,
    pub smart_chunking: bool,
    pub max_overlays_per_batch: usize,
    /// Hardware encoder order; empty means software only
    pub hw_preference: Vec<HwAccel>,
    /// Allow hardware encoders for the compositing passes
    pub hw_compositing: bool,
    /// Per-invocation engine timeout
    pub job_timeout: Duration,
    /// Prometheus listener address
    pub metrics_addr: Option<SocketAddr>,
    /// Emit JSON logs
    pub json_logs: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let settings = RenderSettings::default();
        Self {
            work_dir: std::env::temp_dir().join("capburn"),
            ffmpeg_bin: settings.ffmpeg_bin,
            ffprobe_bin: settings.ffprobe_bin,
            font_dir: None,
            default_font_family: settings.default_font_family,
            chunk_secs: settings.chunk_secs,
            smart_chunking: settings.smart_chunking,
            max_overlays_per_batch: settings.max_overlays_per_batch,
            hw_preference: settings.hw_preference,
            hw_compositing: settings.hw_compositing,
            job_timeout: Duration::from_secs(3600), // 1 hour
            metrics_addr: None,
            json_logs: false,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from any key lookup; unset or unparsable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            work_dir: lookup("CAPBURN_WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            ffmpeg_bin: lookup("CAPBURN_FFMPEG").map(PathBuf::from).unwrap_or(defaults.ffmpeg_bin),
            ffprobe_bin: lookup("CAPBURN_FFPROBE").map(PathBuf::from).unwrap_or(defaults.ffprobe_bin),
            font_dir: lookup("CAPBURN_FONT_DIR").map(PathBuf::from),
            default_font_family: lookup("CAPBURN_DEFAULT_FONT").unwrap_or(defaults.default_font_family),
            chunk_secs: parsed(&lookup, "CAPBURN_CHUNK_SECS").unwrap_or(defaults.chunk_secs),
            smart_chunking: parsed(&lookup, "CAPBURN_SMART_CHUNKING").unwrap_or(defaults.smart_chunking),
            max_overlays_per_batch: parsed(&lookup, "CAPBURN_MAX_OVERLAYS_PER_BATCH")
                .unwrap_or(defaults.max_overlays_per_batch),
            hw_preference: lookup("CAPBURN_HW_PREFERENCE")
                .map(|list| parse_hw_preference(&list))
                .unwrap_or(defaults.hw_preference),
            hw_compositing: parsed(&lookup, "CAPBURN_HW_COMPOSITING").unwrap_or(defaults.hw_compositing),
            job_timeout: parsed(&lookup, "CAPBURN_JOB_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            metrics_addr: parsed(&lookup, "CAPBURN_METRICS_ADDR"),
            json_logs: lookup("LOG_FORMAT")
                .map(|v| v.to_lowercase() == "json")
                .unwrap_or(false),
        }
    }

    /// Render settings for one job.
    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            chunk_secs: self.chunk_secs,
            smart_chunking: self.smart_chunking,
            max_overlays_per_batch: self.max_overlays_per_batch,
            hw_preference: self.hw_preference.clone(),
            hw_compositing: self.hw_compositing,
            engine_timeout_secs: Some(self.job_timeout.as_secs()),
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            ffprobe_bin: self.ffprobe_bin.clone(),
            font_dir: self.font_dir.clone(),
            default_font_family: self.default_font_family.clone(),
            temp_root: Some(self.work_dir.clone()),
            ..RenderSettings::default()
        }
    }
}

/// Parse `key` when set; unparsable values count as unset.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

/// Parse a comma-separated encoder list, skipping unknown names.
///
/// `none` anywhere in the list disables hardware encoding.
pub fn parse_hw_preference(list: &str) -> Vec<HwAccel> {
    let mut preference = Vec::new();
    for name in list.split(',').filter(|s| !s.trim().is_empty()) {
        match name.parse::<HwAccel>() {
            Ok(HwAccel::None) => return Vec::new(),
            Ok(hw) if !preference.contains(&hw) => preference.push(hw),
            Ok(_) => {}
            Err(e) => tracing::warn!("Ignoring CAPBURN_HW_PREFERENCE entry: {}", e),
        }
    }
    preference
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = WorkerConfig::from_lookup(|_| None);
        assert_eq!(config.chunk_secs, 60.0);
        assert!(config.smart_chunking);
        assert!(config.metrics_addr.is_none());
        assert!(!config.json_logs);
    }

    #[test]
    fn test_reads_overrides() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("CAPBURN_WORK_DIR", "/var/tmp/jobs"),
            ("CAPBURN_CHUNK_SECS", "30"),
            ("CAPBURN_SMART_CHUNKING", "false"),
            ("CAPBURN_MAX_OVERLAYS_PER_BATCH", "8"),
            ("CAPBURN_HW_PREFERENCE", "nvenc, qsv"),
            ("CAPBURN_METRICS_ADDR", "127.0.0.1:9100"),
            ("LOG_FORMAT", "JSON"),
        ]));

        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/jobs"));
        assert_eq!(config.chunk_secs, 30.0);
        assert!(!config.smart_chunking);
        assert_eq!(config.max_overlays_per_batch, 8);
        assert_eq!(config.hw_preference, vec![HwAccel::Nvenc, HwAccel::Qsv]);
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
        assert!(config.json_logs);
    }

    #[test]
    fn test_reads_every_key() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("CAPBURN_WORK_DIR", "/srv/capburn"),
            ("CAPBURN_FFMPEG", "/opt/ffmpeg/bin/ffmpeg"),
            ("CAPBURN_FFPROBE", "/opt/ffmpeg/bin/ffprobe"),
            ("CAPBURN_FONT_DIR", "/srv/fonts"),
            ("CAPBURN_DEFAULT_FONT", "Noto Sans"),
            ("CAPBURN_CHUNK_SECS", "45.5"),
            ("CAPBURN_SMART_CHUNKING", "false"),
            ("CAPBURN_MAX_OVERLAYS_PER_BATCH", "12"),
            ("CAPBURN_HW_PREFERENCE", "qsv"),
            ("CAPBURN_HW_COMPOSITING", "true"),
            ("CAPBURN_JOB_TIMEOUT_SECS", "900"),
            ("CAPBURN_METRICS_ADDR", "0.0.0.0:9000"),
            ("LOG_FORMAT", "json"),
        ]));

        assert_eq!(config.work_dir, PathBuf::from("/srv/capburn"));
        assert_eq!(config.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.ffprobe_bin, PathBuf::from("/opt/ffmpeg/bin/ffprobe"));
        assert_eq!(config.font_dir, Some(PathBuf::from("/srv/fonts")));
        assert_eq!(config.default_font_family, "Noto Sans");
        assert_eq!(config.chunk_secs, 45.5);
        assert!(!config.smart_chunking);
        assert_eq!(config.max_overlays_per_batch, 12);
        assert_eq!(config.hw_preference, vec![HwAccel::Qsv]);
        assert!(config.hw_compositing);
        assert_eq!(config.job_timeout, Duration::from_secs(900));
        assert_eq!(config.metrics_addr, Some("0.0.0.0:9000".parse().unwrap()));
        assert!(config.json_logs);
    }

    #[test]
    fn test_unparsable_values_keep_defaults() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("CAPBURN_CHUNK_SECS", "soon"),
            ("CAPBURN_METRICS_ADDR", "not-an-addr"),
        ]));
        assert_eq!(config.chunk_secs, 60.0);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn test_hw_preference_none_disables() {
        assert!(parse_hw_preference("nvenc,none").is_empty());
        assert_eq!(
            parse_hw_preference("vaapi,bogus,vaapi"),
            vec![HwAccel::Vaapi]
        );
    }

    #[test]
    fn test_render_settings_carry_config() {
        let config = WorkerConfig {
            work_dir: PathBuf::from("/scratch"),
            job_timeout: Duration::from_secs(120),
            ..Default::default()
        };
        let settings = config.render_settings();
        assert_eq!(settings.temp_root, Some(PathBuf::from("/scratch")));
        assert_eq!(settings.engine_timeout_secs, Some(120));
        assert_eq!(settings.smart_window_secs, 10.0);
    }
}
