//! Immutable per-test and per-run settings consumed by the orchestrator.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::types::FailurePolicy;
use crate::interaction::{HoldInputs, Interaction};
use crate::io::metrics::DEFAULT_RECORDER_GRACE;
use crate::io::process::DEFAULT_TERMINATE_GRACE;

pub const DEFAULT_READY_MARKER: &str = "textures/atlas/mob_effects.png-atlas";

/// Waits and poll cadences for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub warmup: Duration,
    pub benchmark: Duration,
    pub ready_poll: Duration,
    pub ready_timeout: Duration,
    pub find_button_timeout: Duration,
    pub find_button_poll: Duration,
    pub terminate_grace: Duration,
    pub recorder_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(90),
            benchmark: Duration::from_secs(120),
            ready_poll: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(1800),
            find_button_timeout: Duration::from_secs(15),
            find_button_poll: Duration::from_secs(2),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            recorder_grace: DEFAULT_RECORDER_GRACE,
        }
    }
}

/// One benchmark test: what to launch, where its world lives, and how to drive it.
pub struct TestSpec {
    pub name: String,
    pub instance_path: PathBuf,
    pub n_iterations: u32,
    pub timings: Timings,
    pub world_path: PathBuf,
    pub backup_path: PathBuf,
    pub mods_path: PathBuf,
    pub client_log_path: PathBuf,
    pub ready_marker: String,
    /// Substring identifying the client runtime in the process table (e.g. `java`).
    pub runtime_process_name: String,
    /// Exact process name handed to the frame-timing recorder (e.g. `java.exe`).
    pub metrics_process_name: String,
    pub spark_present: bool,
    pub interaction: Box<dyn Interaction>,
    pub end_interaction: Box<dyn Interaction>,
}

impl TestSpec {
    /// A spec with default timings and instance-relative mods/log paths.
    pub fn new(name: impl Into<String>, instance_path: &Path, world_path: &Path) -> Self {
        let hold = HoldInputs::default_benchmark();
        Self {
            name: name.into(),
            instance_path: instance_path.to_path_buf(),
            n_iterations: 3,
            timings: Timings::default(),
            world_path: world_path.to_path_buf(),
            backup_path: PathBuf::from("world_backup"),
            mods_path: instance_path.join("mods"),
            client_log_path: instance_path.join("logs").join("latest.log"),
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            runtime_process_name: "java".to_string(),
            metrics_process_name: "java.exe".to_string(),
            spark_present: false,
            end_interaction: Box::new(hold.release()),
            interaction: Box::new(hold),
        }
    }
}

impl fmt::Debug for TestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSpec")
            .field("name", &self.name)
            .field("instance_path", &self.instance_path)
            .field("n_iterations", &self.n_iterations)
            .field("world_path", &self.world_path)
            .field("backup_path", &self.backup_path)
            .finish_non_exhaustive()
    }
}

/// Settings shared by every test and iteration of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub launcher_path: PathBuf,
    pub present_mon_path: Option<PathBuf>,
    pub present_mon_csv_path: PathBuf,
    pub results_dir: PathBuf,
    pub singleplayer_button_images: Vec<PathBuf>,
    pub world_button_images: Vec<PathBuf>,
    pub failure_policy: FailurePolicy,
    /// Promote pre-flight warnings (missing instance, stray runtime processes) to errors.
    pub strict_preflight: bool,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, launcher_path: &Path, results_dir: &Path) -> Self {
        Self {
            run_id: run_id.into(),
            launcher_path: launcher_path.to_path_buf(),
            present_mon_path: None,
            present_mon_csv_path: PathBuf::from("present_mon.csv"),
            results_dir: results_dir.to_path_buf(),
            singleplayer_button_images: Vec::new(),
            world_button_images: Vec::new(),
            failure_policy: FailurePolicy::default(),
            strict_preflight: false,
        }
    }
}

/// Timestamped run id (`YYYYmmdd_HHMMSS`).
pub fn new_run_id() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}
