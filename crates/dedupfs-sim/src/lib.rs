//! dedupfs simulator
//!
//! Drives a [`dedupfs_core::DedupManager`] wired to the mock transaction and
//! reference managers with a synthetic write workload, and reports what the
//! index saved.

pub mod cli;
pub mod config;
pub mod workload;

pub use config::{SimConfig, WorkloadConfig};
pub use workload::{run_workload, WorkloadReport};
