//! Frame-timing capture via an external recorder (PresentMon).
//!
//! The recorder is told to exit on its own when the target process exits, so
//! its lifetime follows the client rather than the orchestrator.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::frames::{FrameSummary, summarize_csv};
use crate::error::BenchError;
use crate::io::process::{detach, resolve_program};

pub const DEFAULT_RECORDER_GRACE: Duration = Duration::from_secs(10);

/// A running recorder and the CSV it writes.
#[derive(Debug)]
pub struct RecorderHandle {
    child: Child,
    output_csv: PathBuf,
}

/// How the recorder ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderExit {
    /// Exited by itself after the target process went away.
    Exited { code: Option<i32> },
    /// Still running after the grace period and killed.
    Killed,
}

/// Remove any stale CSV, then start the recorder against `process_name`.
#[instrument(skip_all, fields(tool = %tool.display(), process_name = %process_name))]
pub fn start(tool: &Path, process_name: &str, output_csv: &Path) -> Result<RecorderHandle, BenchError> {
    debug!("launching frame-timing recorder");
    if output_csv.is_file() {
        debug!(csv = %output_csv.display(), "removing old recorder csv file");
        fs::remove_file(output_csv).map_err(|e| BenchError::io("remove stale csv", output_csv, e))?;
    }
    if let Some(parent) = output_csv.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| BenchError::io("create csv directory", parent, e))?;
    }

    let resolved = resolve_program(tool)?;
    let mut cmd = Command::new(resolved);
    cmd.args(recorder_args(process_name, output_csv))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    detach(&mut cmd, false);
    let child = cmd.spawn().map_err(|e| BenchError::spawn(tool, e))?;
    info!(pid = child.id(), "frame-timing recorder started");

    Ok(RecorderHandle {
        child,
        output_csv: output_csv.to_path_buf(),
    })
}

fn recorder_args(process_name: &str, output_csv: &Path) -> Vec<std::ffi::OsString> {
    vec![
        "-process_name".into(),
        process_name.into(),
        "-output_file".into(),
        output_csv.as_os_str().to_owned(),
        "-terminate_on_proc_exit".into(),
    ]
}

impl RecorderHandle {
    pub fn output_csv(&self) -> &Path {
        &self.output_csv
    }

    /// Wait up to `grace` for the recorder to exit by itself, killing it otherwise.
    ///
    /// A non-zero exit is logged and tolerated: the recorder reports one when its
    /// target is force-terminated.
    pub fn finish(mut self, grace: Duration) -> Result<RecorderExit> {
        match self
            .child
            .wait_timeout(grace)
            .context("wait for frame-timing recorder")?
        {
            Some(status) => {
                if !status.success() {
                    warn!(exit_code = ?status.code(), "frame-timing recorder exited with non-zero status");
                }
                Ok(RecorderExit::Exited {
                    code: status.code(),
                })
            }
            None => {
                warn!(grace_secs = grace.as_secs(), "frame-timing recorder still running, killing");
                self.child.kill().context("kill frame-timing recorder")?;
                self.child
                    .wait()
                    .context("wait frame-timing recorder after kill")?;
                Ok(RecorderExit::Killed)
            }
        }
    }
}

/// Move the recorder CSV into `dest_dir` and summarize it.
pub fn archive_csv(csv: &Path, dest_dir: &Path) -> Result<(PathBuf, FrameSummary)> {
    let contents = fs::read_to_string(csv)
        .with_context(|| format!("read recorder csv {}", csv.display()))?;
    let summary =
        summarize_csv(&contents).with_context(|| format!("summarize {}", csv.display()))?;

    fs::create_dir_all(dest_dir)
        .with_context(|| format!("create results dir {}", dest_dir.display()))?;
    let file_name = csv
        .file_name()
        .with_context(|| format!("recorder csv has no file name {}", csv.display()))?;
    let dest = dest_dir.join(file_name);
    fs::copy(csv, &dest).with_context(|| format!("copy {} to {}", csv.display(), dest.display()))?;
    fs::remove_file(csv).with_context(|| format!("remove {}", csv.display()))?;
    Ok((dest, summary))
}
