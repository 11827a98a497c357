//! Benchmark configuration stored in `clientbench.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::spark::is_spark_jar;
use crate::core::types::FailurePolicy;
use crate::interaction::HoldInputs;
use crate::plan::{DEFAULT_READY_MARKER, RunContext, TestSpec, Timings};

pub const DEFAULT_CONFIG_FILE: &str = "clientbench.toml";

/// Benchmark configuration (TOML).
///
/// Edited by humans; every field except `launcher_path` and the per-test
/// `name`/`instance_path` has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BenchConfig {
    /// Launcher executable started as `<launcher> --launch <instance_path>`.
    pub launcher_path: PathBuf,

    /// Frame-timing recorder (PresentMon). Measuring runs without telemetry when unset.
    pub present_mon_path: Option<PathBuf>,

    /// Where the recorder writes its CSV before it is archived per iteration.
    pub present_mon_csv_path: PathBuf,

    /// Root directory for per-run, per-iteration results.
    pub benchmark_results_path: PathBuf,

    /// Candidate images for the singleplayer button, in priority order.
    pub singleplayer_button_images: Vec<PathBuf>,

    /// Candidate images for the world entry, in priority order.
    pub world_button_images: Vec<PathBuf>,

    pub on_iteration_failure: FailurePolicy,

    /// Fail instead of warn on a missing instance, launcher, or stray runtime process.
    pub strict_preflight: bool,

    pub screen: HelperConfig,
    pub input: HelperConfig,

    pub tests: Vec<TestConfig>,
}

/// External helper program invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HelperConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30,
        }
    }
}

/// One `[[tests]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    pub name: String,
    pub instance_path: PathBuf,
    pub n_iterations: u32,
    pub warmup_time_secs: u64,
    pub benchmark_time_secs: u64,
    pub ready_log_line: String,
    pub ready_log_interval_secs: u64,
    pub ready_log_timeout_secs: u64,
    pub find_button_timeout_secs: u64,
    pub look_for_button_interval_secs: u64,
    pub terminate_grace_ms: u64,
    pub recorder_grace_secs: u64,
    pub backup_world_path: PathBuf,
    /// Defaults to `<instance_path>/mods`.
    pub mods_path: Option<PathBuf>,
    /// Defaults to the first directory under `<instance_path>/saves`.
    pub world_path: Option<PathBuf>,
    /// Defaults to `<instance_path>/logs/latest.log`.
    pub client_log_file_path: Option<PathBuf>,
    pub java_process_name: String,
    pub mc_process_name: String,
    /// Defaults to whether a spark jar is present in the mods directory.
    pub spark_present: Option<bool>,
    pub interaction: InteractionConfig,
}

/// Inputs held for the measured window and released at its end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InteractionConfig {
    pub hold_keys: Vec<String>,
    pub hold_buttons: Vec<String>,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        let hold = HoldInputs::default_benchmark();
        Self {
            hold_keys: hold.keys,
            hold_buttons: hold.buttons,
        }
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        let timings = Timings::default();
        Self {
            name: String::new(),
            instance_path: PathBuf::new(),
            n_iterations: 3,
            warmup_time_secs: timings.warmup.as_secs(),
            benchmark_time_secs: timings.benchmark.as_secs(),
            ready_log_line: DEFAULT_READY_MARKER.to_string(),
            ready_log_interval_secs: timings.ready_poll.as_secs(),
            ready_log_timeout_secs: timings.ready_timeout.as_secs(),
            find_button_timeout_secs: timings.find_button_timeout.as_secs(),
            look_for_button_interval_secs: timings.find_button_poll.as_secs(),
            terminate_grace_ms: timings.terminate_grace.as_millis() as u64,
            recorder_grace_secs: timings.recorder_grace.as_secs(),
            backup_world_path: PathBuf::from("world_backup"),
            mods_path: None,
            world_path: None,
            client_log_file_path: None,
            java_process_name: "java".to_string(),
            mc_process_name: "java.exe".to_string(),
            spark_present: None,
            interaction: InteractionConfig::default(),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            launcher_path: PathBuf::new(),
            present_mon_path: None,
            present_mon_csv_path: PathBuf::from("present_mon.csv"),
            benchmark_results_path: PathBuf::from("benchmark_results"),
            singleplayer_button_images: Vec::new(),
            world_button_images: Vec::new(),
            on_iteration_failure: FailurePolicy::Continue,
            strict_preflight: false,
            screen: HelperConfig::default(),
            input: HelperConfig::default(),
            tests: Vec::new(),
        }
    }
}

impl BenchConfig {
    /// A starting point for `clientbench init`.
    pub fn template() -> Self {
        Self {
            launcher_path: PathBuf::from("C:/Program Files/PrismLauncher/prismlauncher.exe"),
            present_mon_path: Some(PathBuf::from("C:/Tools/PresentMon.exe")),
            singleplayer_button_images: vec![PathBuf::from("images/singleplayer.png")],
            world_button_images: vec![PathBuf::from("images/world.png")],
            screen: HelperConfig {
                command: vec!["clientbench-screen".to_string()],
                ..HelperConfig::default()
            },
            input: HelperConfig {
                command: vec!["clientbench-input".to_string()],
                ..HelperConfig::default()
            },
            tests: vec![TestConfig {
                name: "baseline".to_string(),
                instance_path: PathBuf::from("C:/Users/me/PrismLauncher/instances/baseline"),
                ..TestConfig::default()
            }],
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.launcher_path.as_os_str().is_empty() {
            return Err(anyhow!("launcher_path must be set"));
        }
        if self.singleplayer_button_images.is_empty() {
            return Err(anyhow!("singleplayer_button_images must be a non-empty array"));
        }
        if self.world_button_images.is_empty() {
            return Err(anyhow!("world_button_images must be a non-empty array"));
        }
        for (label, helper) in [("screen", &self.screen), ("input", &self.input)] {
            if helper.command.first().is_none_or(|p| p.trim().is_empty()) {
                return Err(anyhow!("{label}.command must be a non-empty array"));
            }
            if helper.timeout_secs == 0 {
                return Err(anyhow!("{label}.timeout_secs must be > 0"));
            }
        }
        if self.tests.is_empty() {
            return Err(anyhow!("at least one [[tests]] entry is required"));
        }
        let mut names = std::collections::BTreeSet::new();
        for test in &self.tests {
            test.validate()?;
            if !names.insert(test.name.as_str()) {
                return Err(anyhow!("duplicate test name '{}'", test.name));
            }
        }
        Ok(())
    }

    pub fn run_context(&self, run_id: &str) -> RunContext {
        RunContext {
            present_mon_path: self.present_mon_path.clone(),
            present_mon_csv_path: self.present_mon_csv_path.clone(),
            singleplayer_button_images: self.singleplayer_button_images.clone(),
            world_button_images: self.world_button_images.clone(),
            failure_policy: self.on_iteration_failure,
            strict_preflight: self.strict_preflight,
            ..RunContext::new(run_id, &self.launcher_path, &self.benchmark_results_path)
        }
    }

    pub fn helper_timeout(helper: &HelperConfig) -> Duration {
        Duration::from_secs(helper.timeout_secs)
    }
}

impl TestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("tests[].name must be non-empty"));
        }
        if self.instance_path.as_os_str().is_empty() {
            return Err(anyhow!("test '{}': instance_path must be set", self.name));
        }
        if self.n_iterations == 0 {
            return Err(anyhow!("test '{}': n_iterations must be > 0", self.name));
        }
        if self.ready_log_line.is_empty() {
            return Err(anyhow!("test '{}': ready_log_line must be non-empty", self.name));
        }
        if self.ready_log_interval_secs == 0 || self.look_for_button_interval_secs == 0 {
            return Err(anyhow!("test '{}': poll intervals must be > 0", self.name));
        }
        if self.java_process_name.trim().is_empty() {
            return Err(anyhow!("test '{}': java_process_name must be non-empty", self.name));
        }
        Ok(())
    }

    /// Resolve derived paths against the instance directory and build the spec.
    pub fn to_spec(&self) -> Result<TestSpec> {
        let world_path = match &self.world_path {
            Some(path) => path.clone(),
            None => first_world(&self.instance_path)
                .with_context(|| format!("resolve world_path for test '{}'", self.name))?,
        };
        let mut spec = TestSpec::new(&self.name, &self.instance_path, &world_path);
        spec.n_iterations = self.n_iterations;
        spec.timings = Timings {
            warmup: Duration::from_secs(self.warmup_time_secs),
            benchmark: Duration::from_secs(self.benchmark_time_secs),
            ready_poll: Duration::from_secs(self.ready_log_interval_secs),
            ready_timeout: Duration::from_secs(self.ready_log_timeout_secs),
            find_button_timeout: Duration::from_secs(self.find_button_timeout_secs),
            find_button_poll: Duration::from_secs(self.look_for_button_interval_secs),
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            recorder_grace: Duration::from_secs(self.recorder_grace_secs),
        };
        spec.backup_path = self.backup_world_path.clone();
        if let Some(mods) = &self.mods_path {
            spec.mods_path = mods.clone();
        }
        if let Some(log) = &self.client_log_file_path {
            spec.client_log_path = log.clone();
        }
        spec.ready_marker = self.ready_log_line.clone();
        spec.runtime_process_name = self.java_process_name.clone();
        spec.metrics_process_name = self.mc_process_name.clone();
        spec.spark_present = self
            .spark_present
            .unwrap_or_else(|| has_spark_mod(&spec.mods_path));

        let hold = HoldInputs {
            keys: self.interaction.hold_keys.clone(),
            buttons: self.interaction.hold_buttons.clone(),
        };
        spec.end_interaction = Box::new(hold.release());
        spec.interaction = Box::new(hold);
        Ok(spec)
    }
}

/// First world directory (by name) under `<instance>/saves`.
pub fn first_world(instance: &Path) -> Result<PathBuf> {
    let saves = instance.join("saves");
    let mut worlds: Vec<PathBuf> = fs::read_dir(&saves)
        .with_context(|| format!("read {}", saves.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    worlds.sort();
    worlds
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no world directory under {}", saves.display()))
}

fn has_spark_mod(mods: &Path) -> bool {
    let Ok(entries) = fs::read_dir(mods) else {
        return false;
    };
    entries
        .filter_map(|entry| entry.ok())
        .any(|entry| is_spark_jar(&entry.file_name().to_string_lossy()))
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<BenchConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: BenchConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &BenchConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Refuse to clobber an existing file unless forced.
pub fn ensure_writable(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
launcher_path = "launcher.exe"
singleplayer_button_images = ["sp1.png", "sp2.png"]
world_button_images = ["world.png"]

[screen]
command = ["screen-helper"]

[input]
command = ["input-helper", "--fast"]

[[tests]]
name = "First test"
instance_path = "instances/first"
world_path = "instances/first/saves/bench"
"#;

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg: BenchConfig = toml::from_str(MINIMAL).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.on_iteration_failure, FailurePolicy::Continue);
        assert_eq!(cfg.present_mon_csv_path, PathBuf::from("present_mon.csv"));
        let test = &cfg.tests[0];
        assert_eq!(test.n_iterations, 3);
        assert_eq!(test.warmup_time_secs, 90);
        assert_eq!(test.benchmark_time_secs, 120);
        assert_eq!(test.ready_log_interval_secs, 2);
        assert_eq!(test.ready_log_timeout_secs, 1800);
        assert_eq!(test.find_button_timeout_secs, 15);
        assert_eq!(test.look_for_button_interval_secs, 2);
        assert_eq!(test.java_process_name, "java");
        assert_eq!(test.ready_log_line, DEFAULT_READY_MARKER);
    }

    #[test]
    fn spec_derives_instance_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let instance = temp.path().join("inst");
        fs::create_dir_all(instance.join("saves").join("b-world")).expect("mkdir");
        fs::create_dir_all(instance.join("saves").join("a-world")).expect("mkdir");
        fs::create_dir_all(instance.join("mods")).expect("mkdir");
        fs::write(instance.join("mods").join("spark-1.10-fabric.jar"), b"").expect("write");

        let test = TestConfig {
            name: "derived".to_string(),
            instance_path: instance.clone(),
            ..TestConfig::default()
        };
        let spec = test.to_spec().expect("spec");

        assert_eq!(spec.world_path, instance.join("saves").join("a-world"));
        assert_eq!(spec.mods_path, instance.join("mods"));
        assert_eq!(
            spec.client_log_path,
            instance.join("logs").join("latest.log")
        );
        assert!(spec.spark_present);
        assert_eq!(spec.timings.ready_timeout, Duration::from_secs(1800));
        assert_eq!(spec.timings.terminate_grace, Duration::from_secs(1));
    }

    #[test]
    fn spec_fails_without_any_world() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("saves")).expect("mkdir");
        let test = TestConfig {
            name: "empty".to_string(),
            instance_path: temp.path().to_path_buf(),
            ..TestConfig::default()
        };
        let err = test.to_spec().unwrap_err();
        assert!(format!("{err:#}").contains("no world directory"));
    }

    #[test]
    fn rejects_duplicate_test_names() {
        let mut cfg: BenchConfig = toml::from_str(MINIMAL).expect("parse");
        cfg.tests.push(cfg.tests[0].clone());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate test name"));
    }

    #[test]
    fn rejects_missing_helpers() {
        let mut cfg: BenchConfig = toml::from_str(MINIMAL).expect("parse");
        cfg.screen.command.clear();
        assert!(cfg.validate().unwrap_err().to_string().contains("screen.command"));
    }

    #[test]
    fn template_writes_then_loads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        let cfg = BenchConfig::template();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn ensure_writable_respects_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("exists.toml");
        fs::write(&path, "").expect("write");
        assert!(ensure_writable(&path, false).is_err());
        ensure_writable(&path, true).expect("forced");
    }
}
