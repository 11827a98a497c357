//! Test and run loops for `clientbench run`.

use anyhow::{Context, Result, bail};
use tracing::{error, info, instrument, warn};

use crate::core::frames::FrameSummary;
use crate::core::types::FailurePolicy;
use crate::io::iteration_log::{IterationMeta, TestSummary, write_iteration, write_run_summary};
use crate::io::process::preflight_check;
use crate::iteration::{Harness, IterationOutcome, run_iteration};
use crate::plan::{RunContext, TestSpec};

/// Reason why `run_test` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStop {
    /// All `n_iterations` ran.
    Completed,
    /// An iteration failed under [`FailurePolicy::Abort`].
    AbortedAfterFailure { iter: u32 },
    /// The world could not be restored; the run cannot continue.
    WorldRestoreFailed { iter: u32 },
}

impl TestStop {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStop::Completed => "completed",
            TestStop::AbortedAfterFailure { .. } => "aborted_after_failure",
            TestStop::WorldRestoreFailed { .. } => "world_restore_failed",
        }
    }
}

/// Summary of one test.
#[derive(Debug)]
pub struct TestOutcome {
    pub name: String,
    pub iterations: Vec<IterationOutcome>,
    pub stop: TestStop,
}

impl TestOutcome {
    pub fn succeeded_count(&self) -> u32 {
        self.iterations.iter().filter(|i| i.succeeded()).count() as u32
    }

    pub fn all_succeeded(&self) -> bool {
        self.stop == TestStop::Completed && self.iterations.iter().all(IterationOutcome::succeeded)
    }

    pub fn summary(&self) -> TestSummary {
        let frames: Vec<_> = self
            .iterations
            .iter()
            .filter_map(|i| i.frames.as_ref())
            .collect();
        let mean = |f: fn(&FrameSummary) -> f64| {
            (!frames.is_empty())
                .then(|| frames.iter().map(|s| f(s)).sum::<f64>() / frames.len() as f64)
        };
        TestSummary {
            test: self.name.clone(),
            iterations: self.iterations.len() as u32,
            succeeded: self.succeeded_count(),
            stop: self.stop.as_str().to_string(),
            mean_avg_fps: mean(|s| s.avg_fps),
            mean_one_percent_low_fps: mean(|s| s.one_percent_low_fps),
        }
    }
}

/// Summary of a whole run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub tests: Vec<TestOutcome>,
    /// Tests skipped because an earlier test could not restore its world.
    pub skipped: Vec<String>,
}

impl RunOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty() && self.tests.iter().all(TestOutcome::all_succeeded)
    }

    /// Whether any test stopped before running all its iterations.
    pub fn stopped_early(&self) -> bool {
        !self.skipped.is_empty() || self.tests.iter().any(|t| t.stop != TestStop::Completed)
    }
}

/// Check host and launcher before the first test.
pub fn preflight_run(ctx: &RunContext) -> Result<()> {
    if !cfg!(windows) {
        warn!("not running on Windows; launch flags, the frame-timing tool and helper programs may not work");
    }
    if !ctx.launcher_path.is_file() {
        if ctx.strict_preflight {
            bail!("launcher {} is not a file", ctx.launcher_path.display());
        }
        warn!(launcher = %ctx.launcher_path.display(), "launcher is not a file; relying on PATH lookup");
    }
    Ok(())
}

/// Check the instance and the process table before a test's first iteration.
pub fn preflight_test(ctx: &RunContext, spec: &TestSpec, harness: Harness<'_>) -> Result<()> {
    if !spec.instance_path.is_dir() {
        if ctx.strict_preflight {
            bail!(
                "instance directory {} does not exist",
                spec.instance_path.display()
            );
        }
        warn!(instance = %spec.instance_path.display(), "instance directory does not exist");
    }
    let existing = preflight_check(harness.supervisor, &spec.runtime_process_name);
    if ctx.strict_preflight && !existing.is_empty() {
        bail!(
            "{} runtime process(es) matching '{}' already running",
            existing.len(),
            spec.runtime_process_name
        );
    }
    Ok(())
}

/// Run every iteration of `spec`, writing each outcome to the results directory.
///
/// Iterations run strictly one after another. Stops early on a failed restore,
/// or on any failure under [`FailurePolicy::Abort`].
#[instrument(skip_all, fields(test = %spec.name))]
pub fn run_test<F: FnMut(&IterationOutcome)>(
    ctx: &RunContext,
    spec: &TestSpec,
    harness: Harness<'_>,
    mut on_iteration: F,
) -> Result<TestOutcome> {
    preflight_test(ctx, spec, harness)?;

    let mut iterations = Vec::with_capacity(spec.n_iterations as usize);
    let mut stop = TestStop::Completed;
    for iter in 1..=spec.n_iterations {
        let outcome = run_iteration(ctx, spec, harness, iter);
        let meta = IterationMeta::from_outcome(&ctx.run_id, &spec.name, &outcome);
        write_iteration(&ctx.results_dir, &meta)
            .with_context(|| format!("write results for iteration {iter}"))?;
        on_iteration(&outcome);

        let next_stop = if outcome.world_restore_failed() {
            error!(iter, "world restore failed; stopping the run");
            Some(TestStop::WorldRestoreFailed { iter })
        } else if !outcome.succeeded() && ctx.failure_policy == FailurePolicy::Abort {
            warn!(iter, "iteration failed; aborting test");
            Some(TestStop::AbortedAfterFailure { iter })
        } else {
            None
        };
        iterations.push(outcome);
        if let Some(next_stop) = next_stop {
            stop = next_stop;
            break;
        }
    }

    Ok(TestOutcome {
        name: spec.name.clone(),
        iterations,
        stop,
    })
}

/// Run tests in order, then write `summary.json` for the run.
pub fn run_benchmark<F: FnMut(&str, &IterationOutcome)>(
    ctx: &RunContext,
    tests: &[TestSpec],
    harness: Harness<'_>,
    mut on_iteration: F,
) -> Result<RunOutcome> {
    preflight_run(ctx)?;
    info!(run_id = %ctx.run_id, tests = tests.len(), "starting benchmark run");

    let mut outcomes = Vec::with_capacity(tests.len());
    let mut skipped = Vec::new();
    for spec in tests {
        if outcomes
            .last()
            .is_some_and(|t: &TestOutcome| matches!(t.stop, TestStop::WorldRestoreFailed { .. }))
        {
            skipped.push(spec.name.clone());
            continue;
        }
        info!(test = %spec.name, iterations = spec.n_iterations, "running test");
        let outcome = run_test(ctx, spec, harness, |iteration| {
            on_iteration(&spec.name, iteration);
        })?;
        outcomes.push(outcome);
    }
    if !skipped.is_empty() {
        warn!(?skipped, "skipped tests after a failed world restore");
    }

    let summaries: Vec<TestSummary> = outcomes.iter().map(TestOutcome::summary).collect();
    let summary_path = write_run_summary(&ctx.results_dir, &ctx.run_id, &summaries)?;
    info!(summary = %summary_path.display(), "benchmark run finished");

    Ok(RunOutcome {
        run_id: ctx.run_id.clone(),
        tests: outcomes,
        skipped,
    })
}
