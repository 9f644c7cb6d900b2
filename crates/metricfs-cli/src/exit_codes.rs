//! Process exit codes and the failure type subcommands report.

/// Numeric exit codes shared by all subcommands.
pub mod codes {
    /// Usage or configuration error.
    pub const CONFIG_ERROR: u8 = 2;
    /// Runtime mount failure.
    pub const MOUNT_FAILURE: u8 = 3;
}

/// A command failure paired with the exit code to report.
#[derive(Debug)]
pub struct CliFailure {
    /// Exit code for the process.
    pub code: u8,
    /// The underlying error, printed to stderr.
    pub error: anyhow::Error,
}

impl CliFailure {
    /// Wraps a usage or configuration error (exit 2).
    pub fn config(error: impl Into<anyhow::Error>) -> Self {
        Self {
            code: codes::CONFIG_ERROR,
            error: error.into(),
        }
    }

    /// Wraps a runtime mount failure (exit 3).
    pub fn mount(error: impl Into<anyhow::Error>) -> Self {
        Self {
            code: codes::MOUNT_FAILURE,
            error: error.into(),
        }
    }
}
