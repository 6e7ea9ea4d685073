//! Telemetry Anomaly Scanner
//!
//! Periodically discovers recently active `(asset_id, metric)` pairs in stored
//! telemetry, fans out one detection task per pair over a task queue, and
//! records z-score outliers as anomaly findings, at most one per sample.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod context;
pub mod db;
pub mod entities;
pub mod errors;
pub mod migrator;
pub mod repositories;
pub mod scheduler;
pub mod services;
pub mod task_queue;
pub mod worker;

pub use context::DetectionContext;
pub use errors::ServiceError;
pub use scheduler::{ScanSummary, Scheduler, SchedulerState};
pub use services::anomaly_detection::{detect_anomalies, AnomalyCandidate, DetectionOutcome};
pub use task_queue::{InMemoryTaskQueue, TaskEnvelope, TaskQueue};
pub use worker::WorkerPool;
