//! Stable exit codes for clientbench CLI commands.

/// Command succeeded; for `run`, every iteration of every test succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, preflight, or other errors.
pub const INVALID: i32 = 1;
/// `clientbench run` finished all tests but at least one iteration failed.
pub const ITERATION_FAILED: i32 = 2;
/// `clientbench run` stopped a test early (abort policy or failed world restore).
pub const ABORTED: i32 = 3;
