//! Shared deterministic types for the iteration state machine.
//!
//! These types define stable contracts between the orchestrator, the iteration
//! log, and the CLI. Serialized names must remain stable across releases.

use serde::{Deserialize, Serialize};

/// One fail-wrapped step of a benchmark iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Backup,
    Launch,
    WaitReady,
    ClickSingleplayer,
    ClickWorld,
    Interaction,
    Warmup,
    StartMetrics,
    Benchmark,
    EndInteraction,
    Terminate,
    CollectMetrics,
    CollectSpark,
    Restore,
}

impl Stage {
    /// Stable tag used in logs and `meta.json`.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Backup => "backup",
            Stage::Launch => "launch",
            Stage::WaitReady => "wait_ready",
            Stage::ClickSingleplayer => "click_singleplayer",
            Stage::ClickWorld => "click_world",
            Stage::Interaction => "interaction",
            Stage::Warmup => "warmup",
            Stage::StartMetrics => "start_metrics",
            Stage::Benchmark => "benchmark",
            Stage::EndInteraction => "end_interaction",
            Stage::Terminate => "terminate",
            Stage::CollectMetrics => "collect_metrics",
            Stage::CollectSpark => "collect_spark",
            Stage::Restore => "restore",
        }
    }

    /// Human-readable description of what failed.
    pub fn failure_message(self) -> &'static str {
        match self {
            Stage::Backup => "failed to backup world",
            Stage::Launch => "failed to launch instance",
            Stage::WaitReady => "failed to wait for client log line",
            Stage::ClickSingleplayer => "failed to click singleplayer button",
            Stage::ClickWorld => "failed to click world button",
            Stage::Interaction => "failed to run benchmark interaction",
            Stage::Warmup => "failed to wait for warm-up",
            Stage::StartMetrics => "failed to launch frame-timing recorder",
            Stage::Benchmark => "failed to wait for benchmark iteration to run",
            Stage::EndInteraction => "failed to run end benchmark interaction",
            Stage::Terminate => "failed to terminate instance",
            Stage::CollectMetrics => "failed to collect frame-timing results",
            Stage::CollectSpark => "failed to read spark profiler results",
            Stage::Restore => "failed to restore world",
        }
    }

    /// Teardown stages run after the protected region regardless of its outcome.
    pub fn is_teardown(self) -> bool {
        matches!(
            self,
            Stage::Terminate | Stage::CollectMetrics | Stage::CollectSpark | Stage::Restore
        )
    }

    /// Phase the iteration enters once this stage completes.
    pub fn completes(self) -> Phase {
        match self {
            Stage::Backup => Phase::BackedUp,
            Stage::Launch => Phase::Launched,
            Stage::WaitReady => Phase::Ready,
            Stage::ClickSingleplayer | Stage::ClickWorld => Phase::Navigated,
            Stage::Interaction | Stage::Warmup => Phase::Interacting,
            Stage::StartMetrics | Stage::Benchmark | Stage::EndInteraction => Phase::Measuring,
            Stage::Terminate | Stage::CollectMetrics | Stage::CollectSpark => {
                Phase::Terminating
            }
            Stage::Restore => Phase::Restored,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Iteration state machine positions.
///
/// `Idle -> BackedUp -> Launched -> Ready -> Navigated -> Interacting -> Measuring
/// -> Terminating -> Restored -> Done`, with `Failed` reachable from any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    BackedUp,
    Launched,
    Ready,
    Navigated,
    Interacting,
    Measuring,
    Terminating,
    Restored,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

/// What the test loop does after an iteration fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record the failure and run the next iteration.
    #[default]
    Continue,
    /// Stop the test after the failed iteration's teardown.
    Abort,
}
