//! One benchmark iteration: backup, launch, drive, measure, then always tear down.
//!
//! Stages between readiness and the end interaction form the protected region.
//! Once the client is launched, terminate and restore run whatever happens
//! inside it, each with its own failure record.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use tracing::{debug, error, info, instrument, warn};

use crate::core::frames::FrameSummary;
use crate::core::spark::{SparkReport, parse_health_report};
use crate::core::types::{Phase, Stage};
use crate::error::{BenchError, IterationFailure};
use crate::io::input::InputDriver;
use crate::io::iteration_log::IterationPaths;
use crate::io::metrics::{self, RecorderHandle};
use crate::io::process::{LaunchRequest, ProcessHandle, Supervisor};
use crate::io::readiness::{LogCursor, wait_with_cursor};
use crate::io::screen::{ScreenMatcher, click_first_match};
use crate::io::snapshot::WorldStore;
use crate::plan::{RunContext, TestSpec};

/// The collaborators an iteration drives.
#[derive(Clone, Copy)]
pub struct Harness<'a> {
    pub supervisor: &'a dyn Supervisor,
    pub world: &'a dyn WorldStore,
    pub screen: &'a dyn ScreenMatcher,
    pub input: &'a dyn InputDriver,
}

/// Result of one iteration, persisted as `meta.json`.
#[derive(Debug)]
pub struct IterationOutcome {
    pub iter: u32,
    /// `Done` or `Failed`.
    pub phase: Phase,
    /// The first failure, from setup or the protected region.
    pub failure: Option<IterationFailure>,
    /// Failures raised while tearing down; never replace `failure`.
    pub teardown_failures: Vec<IterationFailure>,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration: Duration,
    pub frames: Option<FrameSummary>,
    pub frames_csv: Option<PathBuf>,
    pub spark: Option<SparkReport>,
}

impl IterationOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.teardown_failures.is_empty()
    }

    /// The world could not be put back; later iterations would run on a dirty world.
    pub fn world_restore_failed(&self) -> bool {
        self.all_failures().any(|f| f.stage == Stage::Restore)
    }

    pub fn all_failures(&self) -> impl Iterator<Item = &IterationFailure> {
        self.failure.iter().chain(self.teardown_failures.iter())
    }
}

/// Live resources owned by one iteration.
#[derive(Default)]
struct IterationState {
    process: Option<ProcessHandle>,
    recorder: Option<RecorderHandle>,
    inputs_held: bool,
}

/// Current phase plus the stage wrapper that advances it.
struct Progress {
    phase: Phase,
}

impl Progress {
    fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    /// Run `stage`, tagging any error with it and advancing the phase on success.
    fn run<T>(
        &mut self,
        stage: Stage,
        op: impl FnOnce() -> Result<T>,
    ) -> Result<T, IterationFailure> {
        debug!(stage = %stage, phase = ?self.phase, "stage starting");
        match catch_panic(op) {
            Ok(value) => {
                let next = stage.completes();
                if next != self.phase {
                    debug!(from = ?self.phase, to = ?next, "phase transition");
                    self.phase = next;
                }
                Ok(value)
            }
            Err(source) => {
                error!(stage = %stage, error = %format!("{source:#}"), "{}", stage.failure_message());
                Err(IterationFailure { stage, source })
            }
        }
    }
}

/// Run `op`, turning a panic into an error.
fn catch_panic<T>(op: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(anyhow!("panicked: {message}"))
        }
    }
}

/// Run one iteration of `spec`.
///
/// Never panics on collaborator failure: every error, and every panic raised
/// inside a stage, ends up in the outcome.
#[instrument(skip_all, fields(test = %spec.name, iter = iter))]
pub fn run_iteration(
    ctx: &RunContext,
    spec: &TestSpec,
    harness: Harness<'_>,
    iter: u32,
) -> IterationOutcome {
    info!(
        "starting iteration {iter}/{} of test {}",
        spec.n_iterations, spec.name
    );
    let started_at = Local::now();
    let clock = Instant::now();
    let mut progress = Progress::new();
    let mut outcome = IterationOutcome {
        iter,
        phase: Phase::Failed,
        failure: None,
        teardown_failures: Vec::new(),
        started_at,
        ended_at: started_at,
        duration: Duration::ZERO,
        frames: None,
        frames_csv: None,
        spark: None,
    };

    match setup(spec, ctx, harness, &mut progress) {
        Ok((process, log)) => {
            let mut state = IterationState {
                process: Some(process),
                ..IterationState::default()
            };
            if let Err(failure) = protected(ctx, spec, harness, log, &mut state, &mut progress) {
                outcome.failure = Some(failure);
            }
            teardown(ctx, spec, harness, iter, state, &mut progress, &mut outcome);
        }
        Err(failure) => {
            if failure.stage == Stage::Launch
                && let Err(err) = harness.world.discard(&spec.backup_path)
            {
                warn!(error = %err, "failed to discard unused world backup");
            }
            outcome.failure = Some(failure);
        }
    }

    outcome.ended_at = Local::now();
    outcome.duration = clock.elapsed();
    if outcome.succeeded() {
        outcome.phase = Phase::Done;
        info!(
            duration_secs = outcome.duration.as_secs(),
            "iteration {iter} completed"
        );
    } else {
        outcome.phase = Phase::Failed;
        warn!(
            failed_in = ?progress.phase,
            failures = outcome.all_failures().count(),
            "iteration {iter} failed"
        );
    }
    outcome
}

/// Backup, then launch. Nothing needs tearing down if this fails.
///
/// The client log position is taken just before launching, so readiness only
/// accepts lines written by the new session.
fn setup(
    spec: &TestSpec,
    ctx: &RunContext,
    harness: Harness<'_>,
    progress: &mut Progress,
) -> Result<(ProcessHandle, LogCursor), IterationFailure> {
    progress.run(Stage::Backup, || {
        Ok(harness.world.backup(&spec.world_path, &spec.backup_path)?)
    })?;
    let request = LaunchRequest::instance(&ctx.launcher_path, &spec.instance_path);
    progress.run(Stage::Launch, || {
        let log = LogCursor::at_end(&spec.client_log_path)
            .map_err(|e| BenchError::io("read log", &spec.client_log_path, e))?;
        debug!(offset = log.offset(), "client log position before launch");
        let process = harness.supervisor.launch(&request)?;
        Ok((process, log))
    })
}

fn protected(
    ctx: &RunContext,
    spec: &TestSpec,
    harness: Harness<'_>,
    mut log: LogCursor,
    state: &mut IterationState,
    progress: &mut Progress,
) -> Result<(), IterationFailure> {
    let timings = &spec.timings;

    progress.run(Stage::WaitReady, || {
        Ok(wait_with_cursor(
            &mut log,
            &spec.ready_marker,
            timings.ready_poll,
            timings.ready_timeout,
        )?)
    })?;

    progress.run(Stage::ClickSingleplayer, || {
        click_first_match(
            harness.screen,
            "singleplayer",
            &ctx.singleplayer_button_images,
            timings.find_button_timeout,
            timings.find_button_poll,
        )
    })?;
    progress.run(Stage::ClickWorld, || {
        click_first_match(
            harness.screen,
            "world",
            &ctx.world_button_images,
            timings.find_button_timeout,
            timings.find_button_poll,
        )
    })?;

    // A partial press still needs releasing.
    state.inputs_held = true;
    progress.run(Stage::Interaction, || spec.interaction.perform(harness.input))?;

    progress.run(Stage::Warmup, || {
        info!(secs = timings.warmup.as_secs(), "warming up");
        thread::sleep(timings.warmup);
        Ok(())
    })?;

    match &ctx.present_mon_path {
        Some(tool) => {
            let recorder = progress.run(Stage::StartMetrics, || {
                Ok(metrics::start(
                    tool,
                    &spec.metrics_process_name,
                    &ctx.present_mon_csv_path,
                )?)
            })?;
            state.recorder = Some(recorder);
        }
        None => debug!("no frame-timing tool configured, measuring without it"),
    }

    progress.run(Stage::Benchmark, || {
        info!(secs = timings.benchmark.as_secs(), "benchmarking");
        thread::sleep(timings.benchmark);
        Ok(())
    })?;

    progress.run(Stage::EndInteraction, || {
        spec.end_interaction.perform(harness.input)
    })?;
    state.inputs_held = false;
    Ok(())
}

/// Release inputs, terminate, collect metrics, restore. Each step runs regardless
/// of the others.
fn teardown(
    ctx: &RunContext,
    spec: &TestSpec,
    harness: Harness<'_>,
    iter: u32,
    mut state: IterationState,
    progress: &mut Progress,
    outcome: &mut IterationOutcome,
) {
    if state.inputs_held {
        debug!("releasing inputs held by the interrupted interaction");
        if let Err(err) = catch_panic(|| spec.end_interaction.perform(harness.input)) {
            warn!(error = %format!("{err:#}"), "failed to release held inputs");
        }
    }

    if let Some(process) = state.process.take() {
        let terminated = progress.run(Stage::Terminate, || {
            harness.supervisor.terminate(
                process,
                &spec.runtime_process_name,
                spec.timings.terminate_grace,
            )
        });
        match terminated {
            Ok(report) if !report.killed.is_empty() => {
                info!(killed = report.killed.len(), "force-killed hung runtime processes");
            }
            Ok(_) => {}
            Err(failure) => outcome.teardown_failures.push(failure),
        }
    }

    let dest_dir = IterationPaths::new(&ctx.results_dir, &ctx.run_id, &spec.name, iter).dir;
    if let Some(recorder) = state.recorder.take() {
        let collected = progress.run(Stage::CollectMetrics, || {
            let csv = recorder.output_csv().to_path_buf();
            recorder.finish(spec.timings.recorder_grace)?;
            metrics::archive_csv(&csv, &dest_dir)
        });
        match collected {
            Ok((csv, summary)) => {
                info!(
                    avg_fps = summary.avg_fps,
                    one_percent_low_fps = summary.one_percent_low_fps,
                    "frame-timing results collected"
                );
                outcome.frames_csv = Some(csv);
                outcome.frames = Some(summary);
            }
            Err(failure) => outcome.teardown_failures.push(failure),
        }
    }

    if spec.spark_present {
        match progress.run(Stage::CollectSpark, || read_spark(spec)) {
            Ok(report) => outcome.spark = report,
            Err(failure) => outcome.teardown_failures.push(failure),
        }
    }

    if let Err(failure) = progress.run(Stage::Restore, || {
        Ok(harness.world.restore(&spec.world_path, &spec.backup_path)?)
    }) {
        outcome.teardown_failures.push(failure);
    }
}

fn read_spark(spec: &TestSpec) -> Result<Option<SparkReport>> {
    let bytes = fs::read(&spec.client_log_path)
        .with_context(|| format!("read client log {}", spec.client_log_path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let report = parse_health_report(text.lines());
    if report.is_empty() {
        debug!("no spark health report in client log");
        return Ok(None);
    }
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;
    use crate::test_support::{
        RecordingInput, RecordingWorldStore, ScriptedScreen, ScriptedSupervisor, TestWorld,
    };

    fn fast_spec(world: &TestWorld) -> TestSpec {
        let mut spec = world.spec("unit");
        spec.n_iterations = 1;
        spec
    }

    #[test]
    fn successful_iteration_ends_done() {
        let world = TestWorld::new().expect("world");
        let spec = fast_spec(&world);
        let ctx = world.context();
        let supervisor = ScriptedSupervisor::default();
        let store = RecordingWorldStore::default();
        let screen = ScriptedScreen::always_found();
        let input = RecordingInput::default();

        let outcome = run_iteration(
            &ctx,
            &spec,
            Harness {
                supervisor: &supervisor,
                world: &store,
                screen: &screen,
                input: &input,
            },
            1,
        );

        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        assert_eq!(outcome.phase, Phase::Done);
        assert_eq!(supervisor.terminate_calls(), 1);
        assert_eq!(store.restore_calls(), 1);
        assert_eq!(screen.clicks(), 2);
        assert!(outcome.frames.is_none());
        assert!(!world.backup_path().exists());
    }

    #[test]
    fn interrupted_interaction_releases_inputs() {
        let world = TestWorld::new().expect("world");
        let mut spec = fast_spec(&world);
        spec.interaction = Box::new(|_: &dyn InputDriver| -> Result<()> { Err(anyhow!("stuck")) });
        let ctx = world.context();
        let supervisor = ScriptedSupervisor::default();
        let store = RecordingWorldStore::default();
        let screen = ScriptedScreen::always_found();
        let input = RecordingInput::default();

        let outcome = run_iteration(
            &ctx,
            &spec,
            Harness {
                supervisor: &supervisor,
                world: &store,
                screen: &screen,
                input: &input,
            },
            1,
        );

        let failure = outcome.failure.as_ref().expect("failure");
        assert_eq!(failure.stage, Stage::Interaction);
        assert!(input.released_all());
        assert_eq!(supervisor.terminate_calls(), 1);
        assert_eq!(store.restore_calls(), 1);
    }

    #[test]
    fn terminate_failure_does_not_skip_restore() {
        let world = TestWorld::new().expect("world");
        let spec = fast_spec(&world);
        let ctx = world.context();
        let supervisor = ScriptedSupervisor::failing_terminate();
        let store = RecordingWorldStore::default();
        let screen = ScriptedScreen::always_found();
        let input = RecordingInput::default();

        let outcome = run_iteration(
            &ctx,
            &spec,
            Harness {
                supervisor: &supervisor,
                world: &store,
                screen: &screen,
                input: &input,
            },
            1,
        );

        assert!(outcome.failure.is_none());
        assert_eq!(outcome.teardown_failures.len(), 1);
        assert_eq!(outcome.teardown_failures[0].stage, Stage::Terminate);
        assert_eq!(store.restore_calls(), 1);
        assert_eq!(outcome.phase, Phase::Failed);
        assert!(!outcome.world_restore_failed());
    }

    #[test]
    fn missing_button_fails_click_stage() {
        let world = TestWorld::new().expect("world");
        let mut spec = fast_spec(&world);
        spec.timings.find_button_timeout = Duration::from_millis(30);
        spec.timings.find_button_poll = Duration::from_millis(10);
        let ctx = world.context();
        let supervisor = ScriptedSupervisor::default();
        let store = RecordingWorldStore::default();
        let screen = ScriptedScreen::never_found();
        let input = RecordingInput::default();

        let outcome = run_iteration(
            &ctx,
            &spec,
            Harness {
                supervisor: &supervisor,
                world: &store,
                screen: &screen,
                input: &input,
            },
            1,
        );

        let failure = outcome.failure.as_ref().expect("failure");
        assert_eq!(failure.stage, Stage::ClickSingleplayer);
        assert!(matches!(
            failure.bench_error(),
            Some(crate::error::BenchError::ElementNotFound { .. })
        ));
        assert!(input.sent().is_empty());
        assert_eq!(supervisor.terminate_calls(), 1);
    }

    #[test]
    fn spark_figures_are_read_after_terminate() {
        let world = TestWorld::new().expect("world");
        world
            .write_client_log(&[
                "[12:00:00] [Render thread/INFO]: textures/atlas/mob_effects.png-atlas",
                "[12:03:00] [spark-worker/INFO]: Memory usage:",
                "[12:03:00] [spark-worker/INFO]:   2.5 GB / 8.0 GB   (31%)",
            ])
            .expect("log");
        let mut spec = fast_spec(&world);
        spec.spark_present = true;
        let ctx = world.context();
        let supervisor = ScriptedSupervisor::default();
        let store = RecordingWorldStore::default();
        let screen = ScriptedScreen::always_found();
        let input = RecordingInput::default();

        let outcome = run_iteration(
            &ctx,
            &spec,
            Harness {
                supervisor: &supervisor,
                world: &store,
                screen: &screen,
                input: &input,
            },
            1,
        );

        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        let spark = outcome.spark.expect("spark");
        assert_eq!(spark.memory_used_gb, Some(2.5));
        assert_eq!(spark.memory_max_gb, Some(8.0));
    }

    #[test]
    fn previous_session_marker_does_not_pass_readiness() {
        let world = TestWorld::new().expect("world");
        world.write_previous_session_log().expect("log");
        let mut spec = fast_spec(&world);
        spec.timings.ready_timeout = Duration::from_millis(100);
        let ctx = world.context();
        let supervisor = ScriptedSupervisor::never_ready();
        let store = RecordingWorldStore::default();
        let screen = ScriptedScreen::always_found();
        let input = RecordingInput::default();

        let outcome = run_iteration(
            &ctx,
            &spec,
            Harness {
                supervisor: &supervisor,
                world: &store,
                screen: &screen,
                input: &input,
            },
            1,
        );

        let failure = outcome.failure.as_ref().expect("failure");
        assert_eq!(failure.stage, Stage::WaitReady);
        assert!(matches!(
            failure.bench_error(),
            Some(crate::error::BenchError::ReadinessTimeout { .. })
        ));
        assert!(screen.located().is_empty());
        assert_eq!(supervisor.terminate_calls(), 1);
        assert_eq!(store.restore_calls(), 1);
    }

    #[test]
    fn unreadable_spark_log_fails_its_own_stage() {
        let world = TestWorld::new().expect("world");
        let mut spec = fast_spec(&world);
        spec.spark_present = true;
        let log = world.log_path();
        spec.interaction = Box::new(move |_: &dyn InputDriver| -> Result<()> {
            fs::remove_file(&log)?;
            Ok(())
        });
        let ctx = world.context();
        let supervisor = ScriptedSupervisor::default();
        let store = RecordingWorldStore::default();
        let screen = ScriptedScreen::always_found();
        let input = RecordingInput::default();

        let outcome = run_iteration(
            &ctx,
            &spec,
            Harness {
                supervisor: &supervisor,
                world: &store,
                screen: &screen,
                input: &input,
            },
            1,
        );

        assert!(outcome.failure.is_none(), "{:?}", outcome.failure);
        assert_eq!(outcome.teardown_failures.len(), 1);
        let failure = &outcome.teardown_failures[0];
        assert_eq!(failure.stage, Stage::CollectSpark);
        assert_eq!(failure.to_string(), "failed to read spark profiler results");
        assert!(outcome.spark.is_none());
        assert_eq!(store.restore_calls(), 1);
    }

    #[test]
    fn panic_in_a_stage_becomes_a_failure() {
        let mut progress = Progress::new();
        let failure = progress
            .run(Stage::Interaction, || -> Result<()> { panic!("hook bug") })
            .unwrap_err();

        assert_eq!(failure.stage, Stage::Interaction);
        assert_eq!(failure.source.to_string(), "panicked: hook bug");
        assert_eq!(progress.phase, Phase::Idle);
    }
}
