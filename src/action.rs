//! Operator-triggered actions.
//!
//! Actions are mutating commands (pause, exclude, include, ...) rendered from
//! the template registry. They run with their own deadline and are always
//! written to the history log, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::CommandError;
use crate::history::HistoryLog;
use crate::process::ExecutionRequest;
use crate::runner::ProcessRunner;

/// Default deadline for actions.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs single action command lines.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    runner: ProcessRunner,
    history: Option<Arc<HistoryLog>>,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(runner: ProcessRunner, timeout: Duration) -> Self {
        Self {
            runner,
            history: None,
            timeout,
        }
    }

    pub fn with_history(mut self, history: Arc<HistoryLog>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executes `command_line`.
    ///
    /// An empty command line fails with `EmptyCommand` before anything runs;
    /// it signals that argument collection did not produce a command.
    pub async fn execute(&self, command_line: &str) -> Result<String, CommandError> {
        if command_line.trim().is_empty() {
            return Err(CommandError::EmptyCommand);
        }
        info!(command = %command_line, "executing action");
        let result = self
            .runner
            .execute(&ExecutionRequest::new(command_line, self.timeout))
            .await;
        let stdout = result.stdout.clone();
        let stderr = result.stderr.clone();
        let outcome = result.into_output();

        if let Some(history) = &self.history {
            let error = match &outcome {
                Ok(_) => Some(stderr).filter(|stderr| !stderr.is_empty()),
                Err(_) if !stderr.is_empty() => Some(stderr),
                Err(err) => Some(err.to_string()),
            };
            history
                .clone()
                .record_async(command_line.to_string(), stdout, error)
                .await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::runner::{RunnerConfig, ShellConfig};

    fn executor(dir: &std::path::Path, timeout: Duration) -> ActionExecutor {
        let runner = ProcessRunner::new(RunnerConfig {
            shell: ShellConfig::posix(),
            settle: Duration::from_millis(10),
            kill_grace: Duration::from_millis(200),
            capture_dir: None,
        });
        ActionExecutor::new(runner, timeout)
            .with_history(Arc::new(HistoryLog::new(dir.join("history.log"))))
    }

    fn history(dir: &std::path::Path) -> String {
        fs::read_to_string(dir.join("history.log")).unwrap_or_default()
    }

    #[tokio::test]
    async fn empty_command_is_rejected_and_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor(dir.path(), DEFAULT_ACTION_TIMEOUT)
            .execute("")
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::EmptyCommand);
        assert_eq!(history(dir.path()), "");
    }

    #[tokio::test]
    async fn logs_every_action_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path(), DEFAULT_ACTION_TIMEOUT);
        assert_eq!(executor.execute("echo paused").await.unwrap(), "paused\n");
        assert!(executor.execute("echo nope >&2; exit 1").await.is_err());
        assert_eq!(
            executor.execute("true").await.unwrap(),
            "Command executed successfully"
        );

        let log = history(dir.path());
        assert_eq!(log.matches("TIMESTAMP: ").count(), 3);
        let commands: Vec<&str> = log
            .lines()
            .filter_map(|line| line.strip_prefix("COMMAND: "))
            .collect();
        assert_eq!(commands, vec!["echo paused", "echo nope >&2; exit 1", "true"]);
        assert_eq!(log.matches("\nERROR:\nnope\n").count(), 1);
    }

    #[tokio::test]
    async fn timeout_is_logged_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = executor(dir.path(), Duration::from_millis(200))
            .execute("sleep 5")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let log = history(dir.path());
        assert!(log.contains("COMMAND: sleep 5\n"));
        assert!(log.contains("ERROR:\nCommand timed out"));
    }
}
