//! I/O collaborators for the benchmark orchestrator.

pub mod config;
pub mod input;
pub mod iteration_log;
pub mod metrics;
pub mod process;
pub mod readiness;
pub mod screen;
pub mod snapshot;
