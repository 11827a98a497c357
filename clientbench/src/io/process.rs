//! Client process supervision: launch, pre-flight enumeration, and teardown.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::BenchError;

pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(1);

#[cfg(windows)]
const HIGH_PRIORITY_CLASS: u32 = 0x0000_0080;
#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

/// Program and arguments for a detached launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl LaunchRequest {
    /// `<launcher> --launch <instance>`.
    pub fn instance(launcher: &Path, instance: &Path) -> Self {
        Self {
            program: launcher.to_path_buf(),
            args: vec![OsString::from("--launch"), instance.as_os_str().to_owned()],
        }
    }
}

/// Handle to a launched process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    child: Option<Child>,
}

impl ProcessHandle {
    /// A handle that only records a pid (no owned child to reap).
    pub fn detached(pid: u32) -> Self {
        Self { pid, child: None }
    }

    fn owned(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
        }
    }
}

/// A running process as seen in the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// What `terminate` had to do beyond the graceful request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminateReport {
    /// Processes matching the runtime name that were force-killed after the grace period.
    pub killed: Vec<ProcessInfo>,
}

/// Process-table operations used by the orchestrator.
pub trait Supervisor {
    /// Start a detached, high-priority process with discarded stdio.
    fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, BenchError>;

    /// Running processes whose name contains `name_substring`.
    fn find_processes(&self, name_substring: &str) -> Vec<ProcessInfo>;

    /// Request graceful exit, wait `grace`, then force-kill stragglers matching `name_substring`.
    fn terminate(
        &self,
        handle: ProcessHandle,
        name_substring: &str,
        grace: Duration,
    ) -> Result<TerminateReport>;
}

/// [`Supervisor`] over the real OS process table.
#[derive(Debug, Default)]
pub struct SystemSupervisor;

impl SystemSupervisor {
    pub fn new() -> Self {
        Self
    }
}

impl Supervisor for SystemSupervisor {
    #[instrument(skip_all, fields(program = %request.program.display()))]
    fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, BenchError> {
        let resolved = resolve_program(&request.program)?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut cmd, true);

        debug!(resolved = %resolved.display(), "spawning client process");
        let child = cmd
            .spawn()
            .map_err(|e| BenchError::spawn(&request.program, e))?;
        info!(pid = child.id(), "client process launched");
        Ok(ProcessHandle::owned(child))
    }

    fn find_processes(&self, name_substring: &str) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        matching_processes(&system, name_substring)
            .map(|(pid, name)| ProcessInfo {
                pid: pid.as_u32(),
                name,
            })
            .collect()
    }

    #[instrument(skip_all, fields(pid = handle.pid, name_substring = %name_substring, grace_ms = grace.as_millis() as u64))]
    fn terminate(
        &self,
        handle: ProcessHandle,
        name_substring: &str,
        grace: Duration,
    ) -> Result<TerminateReport> {
        debug!("terminating client process");
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let graceful = stop_client(&system, handle, grace);
        finish_terminate(graceful, || {
            system.refresh_processes(ProcessesToUpdate::All, true);
            kill_stragglers(&system, name_substring)
        })
    }
}

/// Run the straggler sweep whatever the graceful phase returned. A
/// graceful-phase error is returned after the sweep.
fn finish_terminate(
    graceful: Result<()>,
    sweep: impl FnOnce() -> TerminateReport,
) -> Result<TerminateReport> {
    let report = sweep();
    match graceful {
        Ok(()) => Ok(report),
        Err(err) => {
            warn!(
                error = %format!("{err:#}"),
                killed = report.killed.len(),
                "graceful exit failed, stragglers swept"
            );
            Err(err.context(format!(
                "stop client process ({} runtime process(es) force-killed)",
                report.killed.len()
            )))
        }
    }
}

fn stop_client(system: &System, handle: ProcessHandle, grace: Duration) -> Result<()> {
    match handle.child {
        Some(mut child) => {
            request_exit(system, &mut child)?;
            if child
                .wait_timeout(grace)
                .context("wait for client process")?
                .is_none()
            {
                warn!(pid = child.id(), "client process ignored termination, killing");
                child.kill().context("kill client process")?;
                child.wait().context("wait client process after kill")?;
            }
        }
        None => {
            if let Some(process) = system.process(Pid::from_u32(handle.pid)) {
                process.kill_with(Signal::Term);
            }
            thread::sleep(grace);
        }
    }
    Ok(())
}

fn kill_stragglers(system: &System, name_substring: &str) -> TerminateReport {
    let mut report = TerminateReport::default();
    for (pid, name) in matching_processes(system, name_substring) {
        warn!(pid = pid.as_u32(), name = %name, "killing a hung runtime process");
        if let Some(process) = system.process(pid)
            && process.kill()
        {
            report.killed.push(ProcessInfo {
                pid: pid.as_u32(),
                name,
            });
        } else {
            warn!(pid = pid.as_u32(), "failed to kill hung runtime process");
        }
    }
    report
}

/// Report (as a warning) any already-running process matching the runtime name.
///
/// Returns the matching processes so callers can escalate to a hard failure.
pub fn preflight_check<S: Supervisor + ?Sized>(
    supervisor: &S,
    name_substring: &str,
) -> Vec<ProcessInfo> {
    let existing = supervisor.find_processes(name_substring);
    if !existing.is_empty() {
        let names: Vec<&str> = existing.iter().map(|p| p.name.as_str()).collect();
        warn!(?names, "found pre-existing runtime processes");
    }
    existing
}

/// Resolve `program` to an executable path (bare names go through `PATH`).
pub fn resolve_program(program: &Path) -> Result<PathBuf, BenchError> {
    which::which(program)
        .map_err(|e| BenchError::launch(program, format!("executable not found ({e})")))
}

/// Give the child its own console (Windows) or process group (elsewhere).
pub(crate) fn detach(cmd: &mut Command, high_priority: bool) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        let mut flags = CREATE_NEW_CONSOLE;
        if high_priority {
            flags |= HIGH_PRIORITY_CLASS;
        }
        cmd.creation_flags(flags);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let _ = high_priority;
        cmd.process_group(0);
    }
}

fn request_exit(system: &System, child: &mut Child) -> Result<()> {
    let graceful = system
        .process(Pid::from_u32(child.id()))
        .and_then(|process| process.kill_with(Signal::Term));
    if graceful.is_none() {
        // No SIGTERM equivalent on this platform.
        child.kill().context("terminate client process")?;
    }
    Ok(())
}

fn matching_processes<'a>(
    system: &'a System,
    name_substring: &'a str,
) -> impl Iterator<Item = (Pid, String)> + 'a {
    let own_pid = std::process::id();
    system
        .processes()
        .iter()
        .filter(move |(pid, _)| pid.as_u32() != own_pid)
        .filter_map(move |(pid, process)| {
            let name = process.name().to_string_lossy().into_owned();
            name.contains(name_substring).then_some((*pid, name))
        })
}

/// Captured helper process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Run a short-lived helper command with a timeout, capturing bounded stdout/stderr.
///
/// Output is drained on reader threads while the child runs so a chatty helper
/// cannot deadlock on a full pipe.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
    }

    Ok(buf)
}
