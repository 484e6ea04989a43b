//! Data structures for command executions and fetch state.
//!
//! This module defines the per-invocation request and result types
//! (`ExecutionRequest`, `ExecutionResult`), the lifecycle of a named fetch
//! operation (`FetchStatus`, `FetchState`), and the cluster/deployment pair
//! every command is built against (`ClusterTarget`).

use std::time::Duration;

use chrono::{DateTime, Local};

use crate::error::CommandError;

/// Placeholder returned when a successful command printed nothing.
pub const EMPTY_SUCCESS_OUTPUT: &str = "Command executed successfully";

/// The cluster and deployment the operator is looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTarget {
    /// Cluster identifier (e.g. `prod1fdb2`).
    pub cluster: String,
    /// Deployment identifier (e.g. `prod1`); only some operations need it.
    pub deployment: String,
}

impl ClusterTarget {
    pub fn new(cluster: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            deployment: deployment.into(),
        }
    }

    pub fn has_cluster(&self) -> bool {
        !self.cluster.trim().is_empty()
    }

    pub fn has_deployment(&self) -> bool {
        !self.deployment.trim().is_empty()
    }
}

/// A single command line to run with a deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub command_line: String,
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn new(command_line: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command_line: command_line.into(),
            timeout,
        }
    }
}

/// The one terminal outcome of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The process exited on its own. `code` is `None` when it was killed by
    /// a signal that did not come from the runner.
    Completed { code: Option<i32> },
    /// The deadline fired first and the process was terminated.
    TimedOut,
    /// The shell could not be spawned.
    LaunchFailed { error: String },
}

/// Captured result of one execution. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub stdout: String,
    pub stderr: String,
    /// Deadline the execution ran under.
    pub timeout: Duration,
}

impl ExecutionResult {
    pub fn exited_normally(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Completed { code: Some(_) })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ExecutionOutcome::Completed { code } => code,
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::TimedOut)
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    /// Converts the result into the payload a caller displays.
    ///
    /// Exit code 0 yields stdout (or a placeholder when stdout is empty).
    /// A non-zero exit yields `ExecutionFailed` carrying stderr, else
    /// stdout, else a generic status message.
    pub fn into_output(self) -> Result<String, CommandError> {
        match self.outcome {
            ExecutionOutcome::Completed { code: Some(0) } => {
                if self.stdout.is_empty() {
                    Ok(EMPTY_SUCCESS_OUTPUT.to_string())
                } else {
                    Ok(self.stdout)
                }
            }
            ExecutionOutcome::Completed { code } => {
                let message = if !self.stderr.is_empty() {
                    self.stderr
                } else if !self.stdout.is_empty() {
                    self.stdout
                } else {
                    match code {
                        Some(code) => format!("Command failed with status {code}"),
                        None => "Command terminated by signal".to_string(),
                    }
                };
                Err(CommandError::ExecutionFailed(message))
            }
            ExecutionOutcome::TimedOut => Err(CommandError::Timeout {
                seconds: whole_seconds_ceil(self.timeout),
            }),
            ExecutionOutcome::LaunchFailed { error } => Err(CommandError::LaunchFailed(error)),
        }
    }
}

// Sub-second deadlines report as at least one second.
fn whole_seconds_ceil(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Lifecycle of a named fetch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Never run, or cleared.
    Idle,
    Loading,
    Succeeded,
    Failed,
}

impl FetchStatus {
    pub fn label(self) -> &'static str {
        match self {
            FetchStatus::Idle => "idle",
            FetchStatus::Loading => "loading",
            FetchStatus::Succeeded => "ok",
            FetchStatus::Failed => "failed",
        }
    }
}

/// Observable state of one named fetch operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchState {
    pub status: FetchStatus,
    pub is_loading: bool,
    /// Display text: the formatted command header plus output (or the
    /// rendered error on failure).
    pub last_output: String,
    pub last_error: Option<String>,
    pub last_updated: Option<DateTime<Local>>,
    /// Command line of the most recent run, if one was built.
    pub command: Option<String>,
}

impl Default for FetchState {
    fn default() -> Self {
        Self {
            status: FetchStatus::Idle,
            is_loading: false,
            last_output: String::new(),
            last_error: None,
            last_updated: None,
            command: None,
        }
    }
}

impl FetchState {
    pub(crate) fn begin(&mut self) {
        self.status = FetchStatus::Loading;
        self.is_loading = true;
    }

    pub(crate) fn succeed(&mut self, command: String, output: String) {
        self.status = FetchStatus::Succeeded;
        self.is_loading = false;
        self.last_output = output;
        self.last_error = None;
        self.last_updated = Some(Local::now());
        self.command = Some(command);
    }

    pub(crate) fn fail(&mut self, command: Option<String>, output: String, error: String) {
        self.status = FetchStatus::Failed;
        self.is_loading = false;
        self.last_output = output;
        self.last_error = Some(error);
        self.command = command;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, FetchStatus::Succeeded | FetchStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(outcome: ExecutionOutcome, stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            outcome,
            stdout: stdout.into(),
            stderr: stderr.into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn success_substitutes_placeholder_for_empty_stdout() {
        let ok = result(ExecutionOutcome::Completed { code: Some(0) }, "", "noise");
        assert!(ok.success());
        assert_eq!(ok.into_output().unwrap(), EMPTY_SUCCESS_OUTPUT);
    }

    #[test]
    fn failure_prefers_stderr_then_stdout_then_status() {
        let failed = result(ExecutionOutcome::Completed { code: Some(2) }, "out", "err");
        assert_eq!(
            failed.into_output(),
            Err(CommandError::ExecutionFailed("err".into()))
        );
        let failed = result(ExecutionOutcome::Completed { code: Some(2) }, "out", "");
        assert_eq!(
            failed.into_output(),
            Err(CommandError::ExecutionFailed("out".into()))
        );
        let failed = result(ExecutionOutcome::Completed { code: Some(3) }, "", "");
        assert_eq!(
            failed.into_output(),
            Err(CommandError::ExecutionFailed(
                "Command failed with status 3".into()
            ))
        );
    }

    #[test]
    fn timeout_and_launch_failure_map_to_errors() {
        let timed_out = result(ExecutionOutcome::TimedOut, "", "");
        assert!(timed_out.timed_out());
        assert!(!timed_out.exited_normally());
        assert_eq!(
            timed_out.into_output(),
            Err(CommandError::Timeout { seconds: 30 })
        );
        let launch = result(
            ExecutionOutcome::LaunchFailed {
                error: "missing".into(),
            },
            "",
            "",
        );
        assert_eq!(launch.exit_code(), None);
        assert_eq!(
            launch.into_output(),
            Err(CommandError::LaunchFailed("missing".into()))
        );
    }

    #[test]
    fn timeout_seconds_round_up() {
        let mut timed_out = result(ExecutionOutcome::TimedOut, "", "");
        timed_out.timeout = Duration::from_millis(900);
        assert_eq!(
            timed_out.clone().into_output(),
            Err(CommandError::Timeout { seconds: 1 })
        );
        timed_out.timeout = Duration::from_millis(30_500);
        assert_eq!(
            timed_out.into_output(),
            Err(CommandError::Timeout { seconds: 31 })
        );
        let message = CommandError::Timeout { seconds: 1 }.to_string();
        assert!(message.starts_with("Command timed out (1 seconds)"));
    }

    #[test]
    fn fetch_state_transitions() {
        let mut state = FetchState::default();
        assert_eq!(state.status, FetchStatus::Idle);
        state.begin();
        assert!(state.is_loading);
        state.succeed("cmd".into(), "out".into());
        assert!(!state.is_loading);
        assert!(state.is_terminal());
        assert!(state.last_updated.is_some());
        state.begin();
        state.fail(None, "shown".into(), "boom".into());
        assert_eq!(state.status, FetchStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert!(!state.is_loading);
    }
}
