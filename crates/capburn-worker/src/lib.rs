//! Caption burn-in render worker.
//!
//! This crate provides:
//! - Environment configuration mapped onto render settings
//! - Tracing initialisation and job-scoped logging
//! - A runner that loads request files and drives the media pipeline
//! - Prometheus metrics export

pub mod config;
pub mod error;
pub mod logging;
pub mod runner;
pub mod telemetry;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::{init_tracing, JobLogger};
pub use runner::{create_job, load_request, plan_json, probe_hw, run_render, HwReport};
