//! Error taxonomy for command construction and execution.
//!
//! Every failure that can surface from the runner, the orchestrator or the
//! action path is one of these variants. Callers render them through
//! `Display`; nothing here is fatal.

use thiserror::Error;

/// Errors produced while validating, launching or awaiting a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The rendered command line was empty, usually because a required
    /// argument was missing.
    #[error("Empty command")]
    EmptyCommand,
    /// Input was rejected before any process was spawned.
    #[error("{0}")]
    Validation(String),
    /// The process exited with a non-zero status.
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),
    /// The process outlived its deadline and was terminated.
    #[error(
        "Command timed out ({seconds} seconds). The efdb command may have been waiting for browser \
         authentication. If a browser window opened, please complete authentication and try again."
    )]
    Timeout { seconds: u64 },
    /// The shell could not be spawned at all.
    #[error("Command execution failed: {0}")]
    LaunchFailed(String),
    /// A task filter was applied before any tasks output was loaded.
    #[error("No tasks loaded yet. Load tasks first.")]
    NoTasksLoaded,
}

impl CommandError {
    /// Returns true for failures detected before a process was spawned.
    pub fn is_validation(&self) -> bool {
        matches!(self, CommandError::EmptyCommand | CommandError::Validation(_))
    }

    /// Returns true when the failure came from the timeout race.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }
}
