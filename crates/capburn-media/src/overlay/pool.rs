//! Worker pool for overlay rasterization.
//!
//! The `OverlaySpec` list is split into contiguous per-caption batches, one per
//! worker. Workers run on the blocking thread pool and talk to the
//! dispatcher only through messages; cancellation reaches them as an
//! explicit control message.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::font::FontBook;
use super::render::write_overlay;
use super::{OverlayArtifact, OverlaySpec};
use crate::error::{MediaError, MediaResult};
use crate::job::cancelled;
use crate::metrics;
use crate::settings::RenderSettings;

/// Sizing of the overlay pool.
#[derive(Debug, Clone, Copy)]
pub struct OverlayPoolConfig {
    pub cpu_fraction: f64,
    pub worker_memory_bytes: u64,
    pub max_workers: usize,
    pub inline_threshold: usize,
}

impl From<&RenderSettings> for OverlayPoolConfig {
    fn from(settings: &RenderSettings) -> Self {
        Self {
            cpu_fraction: settings.pool_cpu_fraction,
            worker_memory_bytes: settings.pool_worker_memory_bytes,
            max_workers: settings.pool_max_workers,
            inline_threshold: settings.pool_inline_threshold,
        }
    }
}

/// Number of workers for this host: a share of the cores, bounded by the
/// memory budget and the cap. Never zero.
pub fn pool_size(config: &OverlayPoolConfig) -> usize {
    compute_pool_size(num_cpus::get(), available_memory_bytes(), config)
}

fn compute_pool_size(cores: usize, memory: Option<u64>, config: &OverlayPoolConfig) -> usize {
    let by_cpu = (cores as f64 * config.cpu_fraction).floor() as usize;
    let by_memory = match (memory, config.worker_memory_bytes) {
        (Some(available), per_worker) if per_worker > 0 => (available / per_worker) as usize,
        _ => usize::MAX,
    };
    by_cpu.min(by_memory).min(config.max_workers).max(1)
}

/// Memory available to new processes; `None` where the platform does not
/// report it.
fn available_memory_bytes() -> Option<u64> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()),
    );
    Some(system.available_memory()).filter(|&bytes| bytes > 0)
}

/// Where and at what size overlays are rendered.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub fonts: Arc<FontBook>,
    pub width: u32,
    pub height: u32,
    pub out_dir: PathBuf,
}

enum WorkerMessage {
    Progress,
    Completed {
        batch: usize,
        artifacts: Vec<OverlayArtifact>,
    },
    Failed {
        batch: usize,
        error: MediaError,
    },
}

enum ControlMessage {
    Cancel,
}

/// Render a contiguous batch. Shared by pool workers and the inline path.
fn render_batch(
    specs: &[OverlaySpec],
    batch: usize,
    target: &RenderTarget,
    mut should_stop: impl FnMut() -> bool,
    mut on_rendered: impl FnMut(),
) -> MediaResult<Vec<OverlayArtifact>> {
    let mut artifacts = Vec::with_capacity(specs.len());
    for spec in specs {
        if should_stop() {
            return Err(MediaError::Cancelled);
        }
        let path = target.out_dir.join(spec.file_name(batch));
        write_overlay(spec, &target.fonts, target.width, target.height, &path)?;
        artifacts.push(OverlayArtifact::new(path, spec.start_secs, spec.end_secs));
        on_rendered();
    }
    Ok(artifacts)
}

/// Split specs into at most `parts` contiguous batches without splitting a caption.
fn split_batches(specs: Vec<OverlaySpec>, parts: usize) -> Vec<Vec<OverlaySpec>> {
    let parts = parts.max(1);
    let target = specs.len().div_ceil(parts).max(1);
    let mut batches: Vec<Vec<OverlaySpec>> = Vec::new();
    let mut current: Vec<OverlaySpec> = Vec::new();

    for spec in specs {
        let caption_changed = current
            .last()
            .map(|last| last.caption_index != spec.caption_index)
            .unwrap_or(false);
        if caption_changed && current.len() >= target && batches.len() + 1 < parts {
            batches.push(std::mem::take(&mut current));
        }
        current.push(spec);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Render every overlay to a PNG in `target.out_dir`.
///
/// Artifacts come back in input order. `on_progress` receives the fraction
/// done as a percentage.
pub async fn render_overlays(
    specs: Vec<OverlaySpec>,
    target: RenderTarget,
    config: OverlayPoolConfig,
    cancel_rx: watch::Receiver<bool>,
    on_progress: impl Fn(f64) + Send,
) -> MediaResult<Vec<OverlayArtifact>> {
    let total = specs.len();
    if total == 0 {
        on_progress(100.0);
        return Ok(Vec::new());
    }
    tokio::fs::create_dir_all(&target.out_dir).await?;

    let workers = pool_size(&config).min(total);
    if workers <= 1 || total < config.inline_threshold {
        debug!(overlays = total, "Rendering overlays inline");
        let mut done = 0usize;
        let artifacts = render_batch(
            &specs,
            0,
            &target,
            || *cancel_rx.borrow(),
            || {
                done += 1;
                on_progress(done as f64 / total as f64 * 100.0);
            },
        )?;
        metrics::record_overlays_rendered(artifacts.len());
        return Ok(artifacts);
    }

    let batches = split_batches(specs, workers);
    info!(overlays = total, workers = batches.len(), "Rendering overlays on worker pool");

    let (tx, mut rx) = mpsc::channel::<WorkerMessage>(batches.len() * 4);
    let mut controls = Vec::with_capacity(batches.len());
    let mut handles = Vec::with_capacity(batches.len());

    for (batch, specs) in batches.into_iter().enumerate() {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMessage>();
        controls.push(control_tx);
        let tx = tx.clone();
        let target = target.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            let result = render_batch(
                &specs,
                batch,
                &target,
                || match control_rx.try_recv() {
                    Ok(ControlMessage::Cancel) => true,
                    Err(mpsc::error::TryRecvError::Disconnected) => true,
                    Err(mpsc::error::TryRecvError::Empty) => false,
                },
                || {
                    let _ = tx.blocking_send(WorkerMessage::Progress);
                },
            );
            let message = match result {
                Ok(artifacts) => WorkerMessage::Completed { batch, artifacts },
                Err(error) => WorkerMessage::Failed { batch, error },
            };
            let _ = tx.blocking_send(message);
        }));
    }
    drop(tx);

    let broadcast_cancel = |controls: &[mpsc::UnboundedSender<ControlMessage>]| {
        for control in controls {
            let _ = control.send(ControlMessage::Cancel);
        }
    };

    let mut results: Vec<Option<Vec<OverlayArtifact>>> = vec![None; controls.len()];
    let mut first_error: Option<MediaError> = None;
    let mut done = 0usize;
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(WorkerMessage::Progress) => {
                    done += 1;
                    on_progress(done as f64 / total as f64 * 100.0);
                }
                Some(WorkerMessage::Completed { batch, artifacts }) => {
                    debug!(batch, overlays = artifacts.len(), "Overlay batch complete");
                    results[batch] = Some(artifacts);
                }
                Some(WorkerMessage::Failed { batch, error }) => {
                    if !error.is_cancelled() {
                        warn!(batch, "Overlay batch failed: {}", error);
                    }
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                    if !cancel_sent {
                        broadcast_cancel(&controls);
                        cancel_sent = true;
                    }
                }
                None => break,
            },
            _ = cancelled(cancel_rx.clone()), if !cancel_sent => {
                info!("Cancellation requested, stopping overlay workers");
                broadcast_cancel(&controls);
                cancel_sent = true;
                first_error = Some(MediaError::Cancelled);
            }
        }
    }

    for handle in handles {
        if let Err(e) = handle.await {
            first_error.get_or_insert_with(|| MediaError::internal(format!("overlay worker panicked: {}", e)));
        }
    }

    if *cancel_rx.borrow() {
        return Err(MediaError::Cancelled);
    }
    if let Some(error) = first_error {
        return Err(error);
    }

    let artifacts: Vec<OverlayArtifact> = results.into_iter().flatten().flatten().collect();
    if artifacts.len() != total {
        return Err(MediaError::internal(format!(
            "expected {} overlays, workers produced {}",
            total,
            artifacts.len()
        )));
    }
    metrics::record_overlays_rendered(artifacts.len());
    Ok(artifacts)
}

/// Files in `dir` that look like overlay images.
pub fn overlay_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().starts_with("overlay_"))
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use capburn_models::CaptionStyle;

    fn config() -> OverlayPoolConfig {
        OverlayPoolConfig::from(&RenderSettings::default())
    }

    fn spec(caption_index: usize, active_word: Option<usize>) -> OverlaySpec {
        OverlaySpec {
            caption_index,
            active_word,
            words: vec!["word".to_string()],
            line_breaks: Vec::new(),
            style: CaptionStyle::default(),
            start_secs: caption_index as f64,
            end_secs: caption_index as f64 + 0.5,
        }
    }

    #[test]
    fn test_pool_size_bounds() {
        let config = config();
        assert_eq!(compute_pool_size(16, None, &config), 8);
        assert_eq!(compute_pool_size(4, None, &config), 3);
        assert_eq!(compute_pool_size(1, None, &config), 1);
        assert_eq!(compute_pool_size(32, Some(300 * 1024 * 1024), &config), 2);
        assert_eq!(compute_pool_size(32, Some(0), &config), 1);
    }

    #[test]
    fn test_host_pool_size_within_cap() {
        let config = config();
        let workers = pool_size(&config);
        assert!(workers >= 1);
        assert!(workers <= config.max_workers);
        assert!(workers <= num_cpus::get().max(1));
        if let Some(memory) = available_memory_bytes() {
            assert!(memory > 0);
        }
    }

    #[test]
    fn test_split_batches_keeps_captions_whole() {
        let specs = vec![
            spec(0, Some(0)),
            spec(0, Some(1)),
            spec(0, Some(2)),
            spec(1, None),
            spec(2, Some(0)),
            spec(2, Some(1)),
            spec(3, None),
        ];
        let batches = split_batches(specs, 3);
        assert!(batches.len() <= 3);
        let flattened: Vec<usize> = batches.iter().flatten().map(|s| s.caption_index).collect();
        assert_eq!(flattened, vec![0, 0, 0, 1, 2, 2, 3]);
        for pair in batches.windows(2) {
            assert_ne!(
                pair[0].last().unwrap().caption_index,
                pair[1].first().unwrap().caption_index
            );
        }
    }

    #[tokio::test]
    async fn test_empty_input_reports_complete() {
        let dir = tempfile::tempdir().unwrap();
        let target = RenderTarget {
            fonts: Arc::new(FontBook::with_dirs(Vec::new(), "none")),
            width: 64,
            height: 36,
            out_dir: dir.path().to_path_buf(),
        };
        let (_tx, rx) = watch::channel(false);
        let seen = std::sync::Mutex::new(Vec::new());
        let artifacts = render_overlays(Vec::new(), target, config(), rx, |p| seen.lock().unwrap().push(p))
            .await
            .unwrap();
        assert!(artifacts.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![100.0]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let target = RenderTarget {
            fonts: Arc::new(FontBook::with_dirs(Vec::new(), "none")),
            width: 64,
            height: 36,
            out_dir: dir.path().to_path_buf(),
        };
        let (_tx, rx) = watch::channel(true);
        let specs = (0..3).map(|i| spec(i, None)).collect();
        let err = render_overlays(specs, target, config(), rx, |_| {}).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(overlay_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_pool_renders_in_spec_order() {
        let fonts = FontBook::new(None, "DejaVu Sans");
        if !fonts.has_fonts() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let target = RenderTarget {
            fonts: Arc::new(fonts),
            width: 160,
            height: 90,
            out_dir: dir.path().to_path_buf(),
        };
        let config = OverlayPoolConfig {
            inline_threshold: 0,
            ..config()
        };
        let specs: Vec<OverlaySpec> = (0..12).map(|i| spec(i, None)).collect();
        let (_tx, rx) = watch::channel(false);
        let artifacts = render_overlays(specs.clone(), target, config, rx, |_| {})
            .await
            .unwrap();

        assert_eq!(artifacts.len(), 12);
        for (artifact, spec) in artifacts.iter().zip(&specs) {
            assert_eq!(artifact.start_secs, spec.start_secs);
            assert!(artifact.path.exists());
        }
        assert_eq!(overlay_files(dir.path()).len(), 12);
    }

    #[tokio::test]
    async fn test_cancel_stops_pool_mid_run() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fonts = FontBook::new(None, "DejaVu Sans");
        if !fonts.has_fonts() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let target = RenderTarget {
            fonts: Arc::new(fonts),
            width: 1920,
            height: 1080,
            out_dir: dir.path().to_path_buf(),
        };
        // Force the worker pool on any host
        let config = OverlayPoolConfig {
            cpu_fraction: 4.0,
            worker_memory_bytes: 0,
            max_workers: 4,
            inline_threshold: 8,
        };
        let total = 200;
        let specs: Vec<OverlaySpec> = (0..total).map(|i| spec(i, None)).collect();
        let (tx, rx) = watch::channel(false);
        let reports = AtomicUsize::new(0);

        let err = render_overlays(specs, target, config, rx, |_| {
            if reports.fetch_add(1, Ordering::SeqCst) + 1 == 6 {
                tx.send_replace(true);
            }
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(reports.load(Ordering::SeqCst) >= 6);
        let written = overlay_files(dir.path()).len();
        assert!(written >= 6);
        assert!(written < total, "all {} overlays were written", written);
    }
}
