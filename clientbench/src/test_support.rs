//! Test-only fakes for the iteration collaborators and a scratch instance layout.

use std::cell::{Cell, RefCell};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::error::BenchError;
use crate::interaction::HoldInputs;
use crate::io::input::{InputAction, InputDriver};
use crate::io::process::{LaunchRequest, ProcessHandle, ProcessInfo, Supervisor, TerminateReport};
use crate::io::screen::{ScreenMatcher, ScreenPoint};
use crate::io::snapshot::{FsWorldStore, WorldStore};
use crate::plan::{DEFAULT_READY_MARKER, RunContext, TestSpec, Timings};

/// Calls made to the scripted collaborators, in order, shared between them.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<&'static str>>>);

impl EventLog {
    pub fn record(&self, event: &'static str) {
        self.0.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.0.borrow().clone()
    }
}

/// [`Supervisor`] that never starts anything and counts calls.
///
/// Each launch plays the client's part in the log: it appends a ready line to
/// `<instance>/logs/latest.log`, unless built with
/// [`ScriptedSupervisor::never_ready`].
#[derive(Debug, Default)]
pub struct ScriptedSupervisor {
    fail_launch: bool,
    fail_terminate: bool,
    never_ready: bool,
    running: Vec<ProcessInfo>,
    launches: Cell<u32>,
    terminates: Cell<u32>,
    events: EventLog,
}

impl ScriptedSupervisor {
    pub fn failing_launch() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    pub fn failing_terminate() -> Self {
        Self {
            fail_terminate: true,
            ..Self::default()
        }
    }

    /// Launches that never log the ready marker.
    pub fn never_ready() -> Self {
        Self {
            never_ready: true,
            ..Self::default()
        }
    }

    /// Report `running` from every process-table lookup.
    pub fn with_running(running: Vec<ProcessInfo>) -> Self {
        Self {
            running,
            ..Self::default()
        }
    }

    /// Record `launch` and `terminate` calls into `events`.
    pub fn with_events(self, events: &EventLog) -> Self {
        Self {
            events: events.clone(),
            ..self
        }
    }

    pub fn launch_calls(&self) -> u32 {
        self.launches.get()
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminates.get()
    }
}

impl Supervisor for ScriptedSupervisor {
    fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, BenchError> {
        self.launches.set(self.launches.get() + 1);
        self.events.record("launch");
        if self.fail_launch {
            return Err(BenchError::launch(&request.program, "scripted launch failure"));
        }
        if !self.never_ready
            && let Some(instance) = request.args.last()
        {
            let log = Path::new(instance).join("logs").join("latest.log");
            append_ready_line(&log).map_err(|e| BenchError::spawn(&request.program, e))?;
        }
        Ok(ProcessHandle::detached(4242 + self.launches.get()))
    }

    fn find_processes(&self, name_substring: &str) -> Vec<ProcessInfo> {
        self.running
            .iter()
            .filter(|p| p.name.contains(name_substring))
            .cloned()
            .collect()
    }

    fn terminate(
        &self,
        _handle: ProcessHandle,
        _name_substring: &str,
        _grace: Duration,
    ) -> Result<TerminateReport> {
        self.terminates.set(self.terminates.get() + 1);
        self.events.record("terminate");
        if self.fail_terminate {
            return Err(anyhow!("scripted terminate failure"));
        }
        Ok(TerminateReport::default())
    }
}

fn ready_line() -> String {
    format!("[12:00:05] [Render thread/INFO]: Created: {DEFAULT_READY_MARKER}")
}

fn append_ready_line(log: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(log)?;
    writeln!(file, "{}", ready_line())
}

/// [`FsWorldStore`] that counts calls and can be told to fail restores.
#[derive(Debug, Default)]
pub struct RecordingWorldStore {
    fail_restore: bool,
    backups: Cell<u32>,
    restores: Cell<u32>,
    discards: Cell<u32>,
    events: EventLog,
}

impl RecordingWorldStore {
    pub fn failing_restore() -> Self {
        Self {
            fail_restore: true,
            ..Self::default()
        }
    }

    /// Record `backup`, `restore` and `discard` calls into `events`.
    pub fn with_events(self, events: &EventLog) -> Self {
        Self {
            events: events.clone(),
            ..self
        }
    }

    pub fn backup_calls(&self) -> u32 {
        self.backups.get()
    }

    pub fn restore_calls(&self) -> u32 {
        self.restores.get()
    }

    pub fn discard_calls(&self) -> u32 {
        self.discards.get()
    }
}

impl WorldStore for RecordingWorldStore {
    fn backup(&self, world: &Path, backup: &Path) -> Result<(), BenchError> {
        self.backups.set(self.backups.get() + 1);
        self.events.record("backup");
        FsWorldStore.backup(world, backup)
    }

    fn restore(&self, world: &Path, backup: &Path) -> Result<(), BenchError> {
        self.restores.set(self.restores.get() + 1);
        self.events.record("restore");
        if self.fail_restore {
            return Err(BenchError::io_precondition(
                "restore world",
                backup,
                "scripted restore failure",
            ));
        }
        FsWorldStore.restore(world, backup)
    }

    fn discard(&self, backup: &Path) -> Result<(), BenchError> {
        self.discards.set(self.discards.get() + 1);
        self.events.record("discard");
        FsWorldStore.discard(backup)
    }
}

/// [`ScreenMatcher`] that either always or never finds its target.
#[derive(Debug)]
pub struct ScriptedScreen {
    found: bool,
    located: RefCell<Vec<PathBuf>>,
    clicks: Cell<u32>,
}

impl ScriptedScreen {
    pub fn always_found() -> Self {
        Self {
            found: true,
            located: RefCell::new(Vec::new()),
            clicks: Cell::new(0),
        }
    }

    pub fn never_found() -> Self {
        Self {
            found: false,
            ..Self::always_found()
        }
    }

    pub fn clicks(&self) -> u32 {
        self.clicks.get()
    }

    /// Images looked up, in order.
    pub fn located(&self) -> Vec<PathBuf> {
        self.located.borrow().clone()
    }
}

impl ScreenMatcher for ScriptedScreen {
    fn locate(&self, image: &Path) -> Result<Option<ScreenPoint>> {
        self.located.borrow_mut().push(image.to_path_buf());
        Ok(self.found.then_some(ScreenPoint { x: 640, y: 360 }))
    }

    fn click(&self, _at: ScreenPoint) -> Result<()> {
        self.clicks.set(self.clicks.get() + 1);
        Ok(())
    }
}

/// [`InputDriver`] that records every action.
#[derive(Debug, Default)]
pub struct RecordingInput {
    sent: RefCell<Vec<InputAction>>,
}

impl RecordingInput {
    pub fn sent(&self) -> Vec<InputAction> {
        self.sent.borrow().clone()
    }

    /// Whether every default benchmark input was released.
    pub fn released_all(&self) -> bool {
        let hold = HoldInputs::default_benchmark();
        let sent = self.sent.borrow();
        hold.keys
            .iter()
            .all(|key| sent.contains(&InputAction::KeyUp(key.clone())))
            && hold
                .buttons
                .iter()
                .all(|button| sent.contains(&InputAction::MouseUp(button.clone())))
    }
}

impl InputDriver for RecordingInput {
    fn send(&self, action: &InputAction) -> Result<()> {
        self.sent.borrow_mut().push(action.clone());
        Ok(())
    }
}

/// Scratch instance: `instance/saves/bench/a.txt`, `instance/logs/`, and a
/// results directory, all under one temp dir.
pub struct TestWorld {
    temp: TempDir,
}

pub const WORLD_FILE_CONTENTS: &str = "original world contents\n";

impl TestWorld {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let world = temp.path().join("instance").join("saves").join("bench");
        fs::create_dir_all(world.join("region"))?;
        fs::write(world.join("a.txt"), WORLD_FILE_CONTENTS)?;
        fs::write(world.join("region").join("r.0.0.mca"), [0u8, 1, 2, 3])?;
        fs::create_dir_all(temp.path().join("instance").join("logs"))?;
        fs::create_dir_all(temp.path().join("instance").join("mods"))?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn instance_path(&self) -> PathBuf {
        self.root().join("instance")
    }

    pub fn world_path(&self) -> PathBuf {
        self.instance_path().join("saves").join("bench")
    }

    pub fn backup_path(&self) -> PathBuf {
        self.root().join("world_backup")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root().join("results")
    }

    pub fn log_path(&self) -> PathBuf {
        self.instance_path().join("logs").join("latest.log")
    }

    /// Write a client log left by a previous session that reached readiness.
    pub fn write_previous_session_log(&self) -> Result<()> {
        let ready = ready_line();
        self.write_client_log(&["[12:00:00] [main/INFO]: Loading client", ready.as_str()])
    }

    pub fn write_client_log(&self, lines: &[&str]) -> Result<()> {
        let mut contents = lines.join("\n");
        contents.push('\n');
        fs::write(self.log_path(), contents)?;
        Ok(())
    }

    /// A test over this world with millisecond-scale timings.
    pub fn spec(&self, name: &str) -> TestSpec {
        let mut spec = TestSpec::new(name, &self.instance_path(), &self.world_path());
        spec.backup_path = self.backup_path();
        spec.timings = Timings {
            warmup: Duration::ZERO,
            benchmark: Duration::ZERO,
            ready_poll: Duration::from_millis(10),
            ready_timeout: Duration::from_secs(2),
            find_button_timeout: Duration::from_millis(200),
            find_button_poll: Duration::from_millis(10),
            terminate_grace: Duration::ZERO,
            recorder_grace: Duration::from_secs(1),
        };
        spec
    }

    pub fn context(&self) -> RunContext {
        let mut ctx = RunContext::new("test-run", &self.root().join("launcher"), &self.results_dir());
        ctx.singleplayer_button_images = vec![PathBuf::from("singleplayer.png")];
        ctx.world_button_images = vec![
            PathBuf::from("world_1080p.png"),
            PathBuf::from("world_1440p.png"),
        ];
        ctx
    }

    pub fn world_file(&self) -> Result<String> {
        Ok(fs::read_to_string(self.world_path().join("a.txt"))?)
    }
}
