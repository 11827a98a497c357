//! Per-iteration result artifacts under `<results>/<run_id>/<test>/<iter>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::core::frames::FrameSummary;
use crate::core::spark::SparkReport;
use crate::core::types::{Phase, Stage};
use crate::error::IterationFailure;
use crate::iteration::IterationOutcome;

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
}

impl IterationPaths {
    pub fn new(results_dir: &Path, run_id: &str, test_name: &str, iter: u32) -> Self {
        let dir = results_dir
            .join(run_id)
            .join(slug(test_name))
            .join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            dir,
        }
    }
}

/// A stage failure flattened for `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub stage: Stage,
    /// Full cause chain, outermost first.
    pub message: String,
}

impl From<&IterationFailure> for FailureRecord {
    fn from(failure: &IterationFailure) -> Self {
        Self {
            stage: failure.stage,
            message: format!("{failure}: {:#}", failure.source),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub test: String,
    pub iter: u32,
    pub phase: Phase,
    pub succeeded: bool,
    pub failure: Option<FailureRecord>,
    pub teardown_failures: Vec<FailureRecord>,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration_ms: u64,
    pub frames: Option<FrameSummary>,
    pub frames_csv: Option<PathBuf>,
    pub spark: Option<SparkReport>,
}

impl IterationMeta {
    pub fn from_outcome(run_id: &str, test: &str, outcome: &IterationOutcome) -> Self {
        Self {
            run_id: run_id.to_string(),
            test: test.to_string(),
            iter: outcome.iter,
            phase: outcome.phase,
            succeeded: outcome.succeeded(),
            failure: outcome.failure.as_ref().map(FailureRecord::from),
            teardown_failures: outcome
                .teardown_failures
                .iter()
                .map(FailureRecord::from)
                .collect(),
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            duration_ms: outcome.duration.as_millis() as u64,
            frames: outcome.frames.clone(),
            frames_csv: outcome.frames_csv.clone(),
            spark: outcome.spark.clone(),
        }
    }
}

pub fn write_iteration(results_dir: &Path, meta: &IterationMeta) -> Result<IterationPaths> {
    let paths = IterationPaths::new(results_dir, &meta.run_id, &meta.test, meta.iter);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    write_json(&paths.meta_path, meta)?;
    Ok(paths)
}

/// One line per test in `<results>/<run_id>/summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub test: String,
    pub iterations: u32,
    pub succeeded: u32,
    pub stop: String,
    pub mean_avg_fps: Option<f64>,
    pub mean_one_percent_low_fps: Option<f64>,
}

pub fn write_run_summary(results_dir: &Path, run_id: &str, tests: &[TestSummary]) -> Result<PathBuf> {
    let dir = results_dir.join(run_id);
    fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
    let path = dir.join("summary.json");
    write_json(&path, &tests)?;
    Ok(path)
}

/// Directory-safe form of a test name.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "test".to_string()
    } else {
        trimmed.to_string()
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
