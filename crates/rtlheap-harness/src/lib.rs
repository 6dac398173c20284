//! Workload harness for rtlheap.
//!
//! This crate provides:
//! - Deterministic allocate/free/resize workloads with content checks
//! - Walk reports with a SHA-256 digest for run-to-run comparison
//! - JSONL rendering and schema validation of heap lifecycle records

#![forbid(unsafe_code)]

pub mod error;
pub mod report;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use report::WalkReport;
pub use structured_log::{LogEmitter, LogEntry, LogLevel};
pub use workload::{WorkloadSpec, WorkloadStats, XorShift64, run_workload};
