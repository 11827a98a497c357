//! Diagnostic tracing for benchmark runs.
//!
//! - **Tracing (this module)**: progress and diagnostics on stderr, filtered by
//!   `RUST_LOG`. Not persisted.
//! - **Iteration results (`io/iteration_log`)**: `meta.json` and `summary.json`
//!   under the results directory. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `verbose`.
///
/// # Example
/// ```bash
/// RUST_LOG=clientbench=trace clientbench run
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
