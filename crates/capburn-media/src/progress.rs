//! Engine progress parsing and whole-job progress aggregation.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Progress information from one FFmpeg invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Current frame number
    pub frame: u64,
    /// Current FPS
    pub fps: f64,
    /// Output time in microseconds
    pub out_time_us: i64,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Percentage of a unit of `total_secs` seconds.
    pub fn percentage(&self, total_secs: f64) -> f64 {
        if self.is_complete {
            return 100.0;
        }
        if total_secs <= 0.0 || self.out_time_us <= 0 {
            return 0.0;
        }
        ((self.out_time_us as f64 / 1_000_000.0) / total_secs * 100.0).min(100.0)
    }
}

/// Caller-supplied progress sink receiving 0..=100.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync + 'static>;

/// Pipeline phases that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPhase {
    /// Building the clip-trimmed base video
    Trim,
    /// Rasterizing overlay images
    Overlays,
    /// Running the engine per chunk
    Compositing,
    /// Concatenation, audio replacement and output validation
    Finalize,
}

impl fmt::Display for RenderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RenderPhase::Trim => "trim",
            RenderPhase::Overlays => "overlays",
            RenderPhase::Compositing => "compositing",
            RenderPhase::Finalize => "finalize",
        };
        write!(f, "{}", s)
    }
}

/// A phase's share of the 0..100 range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseBand {
    pub phase: RenderPhase,
    pub start: f64,
    pub width: f64,
}

/// Ordered phase bands covering 0..100.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressPlan {
    bands: Vec<PhaseBand>,
}

impl ProgressPlan {
    /// Build contiguous bands from `(phase, weight)` pairs; weights are normalised.
    pub fn from_weights(weights: &[(RenderPhase, f64)]) -> Self {
        let total: f64 = weights.iter().map(|(_, w)| w.max(0.0)).sum();
        let mut start = 0.0;
        let bands = weights
            .iter()
            .map(|&(phase, weight)| {
                let width = if total > 0.0 {
                    weight.max(0.0) / total * 100.0
                } else {
                    0.0
                };
                let band = PhaseBand { phase, start, width };
                start += width;
                band
            })
            .collect();
        Self { bands }
    }

    /// Bands used by the caption pipeline.
    pub fn for_pipeline(with_trim: bool) -> Self {
        if with_trim {
            Self::from_weights(&[
                (RenderPhase::Trim, 20.0),
                (RenderPhase::Overlays, 30.0),
                (RenderPhase::Compositing, 45.0),
                (RenderPhase::Finalize, 5.0),
            ])
        } else {
            Self::from_weights(&[
                (RenderPhase::Overlays, 45.0),
                (RenderPhase::Compositing, 50.0),
                (RenderPhase::Finalize, 5.0),
            ])
        }
    }

    pub fn band(&self, phase: RenderPhase) -> Option<PhaseBand> {
        self.bands.iter().copied().find(|b| b.phase == phase)
    }

    pub fn bands(&self) -> &[PhaseBand] {
        &self.bands
    }
}

/// Overall percentage for a phase-local percentage.
pub fn aggregate(band_start: f64, band_width: f64, local_pct: f64) -> f64 {
    let local = if local_pct.is_nan() {
        0.0
    } else {
        local_pct.clamp(0.0, 100.0)
    };
    (band_start + local / 100.0 * band_width).clamp(0.0, 100.0)
}

/// Merges phase-local reports into one non-decreasing value.
///
/// Updates may arrive out of order from parallel workers; anything below
/// the highest value already reported is swallowed.
pub struct ProgressAggregator {
    plan: ProgressPlan,
    last: Mutex<u8>,
    sink: Option<ProgressFn>,
}

impl ProgressAggregator {
    pub fn new(plan: ProgressPlan, sink: Option<ProgressFn>) -> Self {
        Self {
            plan,
            last: Mutex::new(0),
            sink,
        }
    }

    pub fn plan(&self) -> &ProgressPlan {
        &self.plan
    }

    /// Report phase-local progress; returns the overall value after the update.
    pub fn report(&self, phase: RenderPhase, local_pct: f64) -> u8 {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let Some(band) = self.plan.band(phase) else {
            return *last;
        };
        let overall = aggregate(band.start, band.width, local_pct).round() as u8;
        if overall > *last {
            *last = overall;
            if let Some(sink) = &self.sink {
                sink(overall);
            }
        }
        *last
    }

    /// Mark a phase as finished.
    pub fn complete(&self, phase: RenderPhase) -> u8 {
        self.report(phase, 100.0)
    }

    /// Highest value reported so far.
    pub fn current(&self) -> u8 {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("plan", &self.plan)
            .field("current", &self.current())
            .finish()
    }
}
