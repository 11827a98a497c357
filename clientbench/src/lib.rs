//! Benchmark iteration orchestrator for a game client.
//!
//! Each iteration backs up a world, launches the client through its launcher,
//! waits for a readiness line in the client log, clicks through the menus by
//! image matching, drives a scripted interaction while a frame-timing recorder
//! runs, then terminates the client and restores the world.
//!
//! - **[`core`]**: Pure logic (stage/phase types, CSV and log parsing). No I/O.
//! - **[`io`]**: Side-effecting collaborators (filesystem, processes, helper
//!   programs) behind traits so the orchestration can be tested with fakes.
//!
//! [`iteration`] and [`looping`] coordinate the collaborators to implement
//! `clientbench run`.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod interaction;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod plan;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
