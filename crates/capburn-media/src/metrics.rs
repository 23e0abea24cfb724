//! Metrics recorded by the render pipeline.
//!
//! Recording is a no-op until a recorder is installed (the worker installs
//! the Prometheus exporter).

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const OVERLAYS_RENDERED_TOTAL: &str = "capburn_overlays_rendered_total";
    pub const ENGINE_INVOCATIONS_TOTAL: &str = "capburn_engine_invocations_total";
    pub const ENGINE_RETRIES_TOTAL: &str = "capburn_engine_retries_total";
    pub const ENGINE_DURATION_SECONDS: &str = "capburn_engine_duration_seconds";
    pub const RENDER_JOBS_TOTAL: &str = "capburn_render_jobs_total";
    pub const RENDER_DURATION_SECONDS: &str = "capburn_render_duration_seconds";
    pub const RENDER_JOBS_ACTIVE: &str = "capburn_render_jobs_active";
    pub const CAPTIONS_DROPPED_TOTAL: &str = "capburn_captions_dropped_total";
}

pub fn record_overlays_rendered(count: usize) {
    counter!(names::OVERLAYS_RENDERED_TOTAL).increment(count as u64);
}

/// Record one engine invocation by operation and outcome.
pub fn record_engine_invocation(operation: &'static str, outcome: &'static str, duration_secs: f64) {
    let labels = [("operation", operation), ("outcome", outcome)];
    counter!(names::ENGINE_INVOCATIONS_TOTAL, &labels).increment(1);
    histogram!(names::ENGINE_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}

/// Record an automatic retry (`resource`, `crash`, `software`, `no_overlay`).
pub fn record_engine_retry(reason: &'static str) {
    counter!(names::ENGINE_RETRIES_TOTAL, "reason" => reason).increment(1);
}

/// Record a finished render job (`succeeded`, `failed`, `cancelled`).
pub fn record_render_job(outcome: &'static str, duration_secs: f64) {
    counter!(names::RENDER_JOBS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::RENDER_DURATION_SECONDS).record(duration_secs);
}

pub fn render_job_started() {
    gauge!(names::RENDER_JOBS_ACTIVE).increment(1.0);
}

pub fn render_job_finished() {
    gauge!(names::RENDER_JOBS_ACTIVE).decrement(1.0);
}

pub fn record_captions_dropped(count: usize) {
    if count > 0 {
        counter!(names::CAPTIONS_DROPPED_TOTAL).increment(count as u64);
    }
}
