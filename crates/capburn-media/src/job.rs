//! The render job aggregate: temp directory, cancellation and process tracking.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use capburn_models::JobId;

use crate::command::FfmpegRunner;
use crate::error::{MediaError, MediaResult};
use crate::progress::{ProgressAggregator, ProgressFn, ProgressPlan};
use crate::settings::RenderSettings;

/// Cloneable handle used to cancel a running job from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> MediaResult<()> {
        if self.is_cancelled() {
            Err(MediaError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` observes `true`; never resolves if the sender is gone.
pub async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashSet<u32>,
    spawned: usize,
    closed: bool,
}

/// Tracks engine processes spawned on behalf of one job.
///
/// Once closed, no further process is admitted.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask permission to spawn a new process.
    pub fn admit(&self) -> MediaResult<()> {
        if self.lock().closed {
            return Err(MediaError::Cancelled);
        }
        Ok(())
    }

    pub fn register(&self, pid: u32) {
        let mut state = self.lock();
        state.active.insert(pid);
        state.spawned += 1;
    }

    pub fn unregister(&self, pid: u32) {
        self.lock().active.remove(&pid);
    }

    /// Refuse further spawns.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn active_pids(&self) -> Vec<u32> {
        self.lock().active.iter().copied().collect()
    }

    /// Total processes spawned over the job's lifetime.
    pub fn spawned_count(&self) -> usize {
        self.lock().spawned
    }
}

/// One invocation of the caption pipeline.
///
/// Owns the temp directory for its whole lifetime; dropping the job removes
/// it on every exit path.
pub struct RenderJob {
    id: JobId,
    temp_dir: TempDir,
    cancel: CancelHandle,
    processes: Arc<ProcessRegistry>,
    progress: Arc<ProgressAggregator>,
    settings: RenderSettings,
}

impl RenderJob {
    /// Create a job and its temp directory.
    pub fn new(settings: RenderSettings) -> MediaResult<Self> {
        Self::with_id(JobId::new(), settings)
    }

    pub fn with_id(id: JobId, settings: RenderSettings) -> MediaResult<Self> {
        let settings = settings.normalized();
        let prefix = format!("capburn-{}-", id.short());
        let temp_dir = match &settings.temp_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix(&prefix).tempdir()?,
        };
        debug!(job_id = %id, temp_dir = %temp_dir.path().display(), "Created job temp directory");

        Ok(Self {
            id,
            temp_dir,
            cancel: CancelHandle::new(),
            processes: Arc::new(ProcessRegistry::new()),
            progress: Arc::new(ProgressAggregator::new(ProgressPlan::for_pipeline(false), None)),
            settings,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A path inside the job's temp directory.
    pub fn temp_file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Create (if needed) and return a subdirectory of the temp directory.
    pub async fn temp_subdir(&self, name: &str) -> MediaResult<PathBuf> {
        let dir = self.temp_dir.path().join(name);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel the job: refuse new processes and signal running ones.
    pub fn cancel(&self) {
        info!(job_id = %self.id, active = self.processes.active_count(), "Cancelling render job");
        self.processes.close();
        self.cancel.cancel();
    }

    pub fn check_cancelled(&self) -> MediaResult<()> {
        if self.cancel.is_cancelled() {
            self.processes.close();
            return Err(MediaError::Cancelled);
        }
        Ok(())
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    pub fn progress(&self) -> &Arc<ProgressAggregator> {
        &self.progress
    }

    /// Install the progress plan and caller sink for this run.
    pub fn set_progress(&mut self, plan: ProgressPlan, sink: Option<ProgressFn>) {
        self.progress = Arc::new(ProgressAggregator::new(plan, sink));
    }

    /// Engine runner bound to this job's cancellation and registry.
    pub fn runner(&self) -> FfmpegRunner {
        let mut runner = FfmpegRunner::new()
            .with_binary(&self.settings.ffmpeg_bin)
            .with_cancel(self.cancel.subscribe())
            .with_registry(Arc::clone(&self.processes));
        if let Some(secs) = self.settings.engine_timeout_secs {
            runner = runner.with_timeout(secs);
        }
        runner
    }

    /// Remove the temp directory, reporting failures instead of ignoring them.
    pub fn close(self) {
        let path = self.temp_dir.path().to_path_buf();
        if let Err(e) = self.temp_dir.close() {
            warn!(job_id = %self.id, path = %path.display(), "Failed to remove job temp directory: {}", e);
        }
    }
}

impl std::fmt::Debug for RenderJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderJob")
            .field("id", &self.id)
            .field("temp_dir", &self.temp_dir.path())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
