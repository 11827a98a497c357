//! Deterministic, pure logic shared by the benchmark orchestration.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (log lines, CSV text) and return deterministic outputs suitable for tests.

pub mod frames;
pub mod spark;
pub mod types;
