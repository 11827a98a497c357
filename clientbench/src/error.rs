//! Error taxonomy for benchmark components and iteration stages.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::types::Stage;

/// Failures raised by the leaf components (snapshot, supervisor, watcher,
/// synchronizer, metrics capture).
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("{action} {}: {reason}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("failed to launch {}: {reason}", .program.display())]
    Launch {
        program: PathBuf,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("didn't find \"{marker}\" in {} within {timeout:?}", .log_path.display())]
    ReadinessTimeout {
        marker: String,
        log_path: PathBuf,
        timeout: Duration,
    },

    #[error("could not find {label} on screen within {timeout:?} (tried {} candidates)", .candidates.len())]
    ElementNotFound {
        label: String,
        candidates: Vec<PathBuf>,
        timeout: Duration,
    },
}

impl BenchError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }

    pub(crate) fn io_precondition(
        action: &'static str,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Io {
            action,
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn launch(program: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Launch {
            program: program.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn spawn(program: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Launch {
            program: program.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }
}

/// A stage-tagged failure inside one benchmark iteration.
///
/// The original cause is kept as the error source so `{:#}` prints the whole chain.
#[derive(Debug)]
pub struct IterationFailure {
    pub stage: Stage,
    pub source: anyhow::Error,
}

impl fmt::Display for IterationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stage.failure_message())
    }
}

impl std::error::Error for IterationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &(dyn std::error::Error + 'static) = &*self.source;
        Some(cause)
    }
}

impl IterationFailure {
    /// The underlying component error, if the cause was one.
    pub fn bench_error(&self) -> Option<&BenchError> {
        self.source.downcast_ref::<BenchError>()
    }
}
