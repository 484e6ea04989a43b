//! Process execution with bounded timeouts.
//!
//! This module contains the `ProcessRunner`, which runs one command line
//! through a login shell, captures stdout and stderr into per-invocation
//! temporary files, races the process against its deadline and makes sure
//! the loser of that race is cleaned up: a timed-out process group gets
//! SIGTERM, then SIGKILL after a grace period.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::process::{ExecutionOutcome, ExecutionRequest, ExecutionResult};

const DEFAULT_SETTLE_MS: u64 = 500;
const DEFAULT_KILL_GRACE_MS: u64 = 1000;

/// Shell used to interpret command lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    /// Shell binary (e.g. `/bin/zsh`).
    pub program: String,
    /// Arguments placed before the command line (e.g. `-l -c`).
    pub args: Vec<String>,
}

impl ShellConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Plain `/bin/sh -c`, without sourcing any profile.
    pub fn posix() -> Self {
        Self::new("/bin/sh", vec!["-c".to_string()])
    }

    /// The operator's login shell, so PATH and credential helpers from the
    /// profile apply to the command.
    pub fn login() -> Self {
        Self::new(default_shell_program(), vec!["-l".to_string(), "-c".to_string()])
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self::login()
    }
}

/// Resolves `$SHELL`, falling back to the platform default.
pub fn default_shell_program() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.trim().is_empty() => shell,
        _ if cfg!(target_os = "macos") => "/bin/zsh".to_string(),
        _ => "/bin/sh".to_string(),
    }
}

/// Tunables for the runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub shell: ShellConfig,
    /// Delay between termination and reading captured output.
    pub settle: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a process.
    pub kill_grace: Duration,
    /// Directory for capture files; the system temp dir when `None`.
    pub capture_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: ShellConfig::default(),
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            capture_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminationSignal {
    Term,
    Kill,
}

/// Runs single command lines as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs `command_line` and converts the result into display output.
    pub async fn run(&self, command_line: &str, timeout: Duration) -> Result<String, CommandError> {
        if command_line.trim().is_empty() {
            return Err(CommandError::EmptyCommand);
        }
        self.execute(&ExecutionRequest::new(command_line, timeout))
            .await
            .into_output()
    }

    /// Executes one request. Output is only read after the process is
    /// known to have terminated; capture files are removed on every path.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let capture = match CaptureFiles::create(self.config.capture_dir.as_deref()) {
            Ok(capture) => capture,
            Err(err) => {
                return launch_failed(request, format!("failed to create capture files: {err}"))
            }
        };

        let mut command = match self.build_command(request, &capture) {
            Ok(command) => command,
            Err(err) => {
                return launch_failed(request, format!("failed to prepare capture files: {err}"))
            }
        };

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(shell = %self.config.shell.program, "failed to spawn shell: {err}");
                return launch_failed(
                    request,
                    format!("failed to spawn {}: {err}", self.config.shell.program),
                );
            }
        };
        drop(command);
        let pid = child.id();
        debug!(?pid, command = %request.command_line, "process started");

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExecutionOutcome::Completed { code: status.code() },
                Err(err) => ExecutionOutcome::LaunchFailed {
                    error: format!("failed to wait for process: {err}"),
                },
            },
            _ = tokio::time::sleep(request.timeout) => ExecutionOutcome::TimedOut,
        };

        if !matches!(outcome, ExecutionOutcome::Completed { .. }) {
            if outcome == ExecutionOutcome::TimedOut {
                warn!(
                    ?pid,
                    timeout_secs = request.timeout.as_secs_f64(),
                    "command timed out"
                );
            }
            self.terminate(&mut child).await;
        }

        tokio::time::sleep(self.config.settle).await;
        let stdout = capture.read_stdout().await;
        let stderr = capture.read_stderr().await;
        debug!(
            ?pid,
            ?outcome,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "process finished"
        );

        ExecutionResult {
            outcome,
            stdout,
            stderr,
            timeout: request.timeout,
        }
    }

    fn build_command(&self, request: &ExecutionRequest, capture: &CaptureFiles) -> io::Result<Command> {
        let shell = &self.config.shell;
        let mut command = Command::new(&shell.program);
        command.args(&shell.args).arg(&request.command_line);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(capture.stdout.reopen()?))
            .stderr(Stdio::from(capture.stderr.reopen()?));
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        Ok(command)
    }

    // Graceful termination of the whole process group, escalating to a
    // forced kill once the grace period runs out.
    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        send_os_signal(child, pid, TerminationSignal::Term);
        match wait_for_exit(child, self.config.kill_grace).await {
            Ok(Some(status)) => {
                debug!(pid, code = ?status.code(), "process exited after SIGTERM");
                return;
            }
            Ok(None) => {
                warn!(pid, "process still running after grace period; killing");
            }
            Err(err) => {
                warn!(pid, "failed waiting for terminated process: {err}");
            }
        }
        send_os_signal(child, pid, TerminationSignal::Kill);
        if let Err(err) = child.kill().await {
            warn!(pid, "failed to kill process: {err}");
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

fn launch_failed(request: &ExecutionRequest, error: String) -> ExecutionResult {
    ExecutionResult {
        outcome: ExecutionOutcome::LaunchFailed { error },
        stdout: String::new(),
        stderr: String::new(),
        timeout: request.timeout,
    }
}

/// Temporary files receiving one invocation's stdout and stderr. Dropping
/// the value deletes both files.
struct CaptureFiles {
    stdout: NamedTempFile,
    stderr: NamedTempFile,
}

impl CaptureFiles {
    fn create(dir: Option<&Path>) -> io::Result<Self> {
        Ok(Self {
            stdout: capture_file("efdbui_output_", dir)?,
            stderr: capture_file("efdbui_error_", dir)?,
        })
    }

    async fn read_stdout(&self) -> String {
        read_capture(self.stdout.path()).await
    }

    async fn read_stderr(&self) -> String {
        read_capture(self.stderr.path()).await
    }
}

fn capture_file(prefix: &str, dir: Option<&Path>) -> io::Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(".txt");
    match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
}

async fn read_capture(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            warn!(path = %path.display(), "failed to read captured output: {err}");
            String::new()
        }
    }
}

#[cfg(unix)]
fn send_os_signal(_child: &mut Child, pid: u32, signal: TerminationSignal) {
    unsafe {
        let sig = match signal {
            TerminationSignal::Term => libc::SIGTERM,
            TerminationSignal::Kill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(child: &mut Child, _pid: u32, _signal: TerminationSignal) {
    // No graceful signal exists here; both stages kill the child.
    let _ = child.start_kill();
}

async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<std::process::ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::process::EMPTY_SUCCESS_OUTPUT;

    fn runner_in(dir: &Path) -> ProcessRunner {
        ProcessRunner::new(RunnerConfig {
            shell: ShellConfig::posix(),
            settle: Duration::from_millis(20),
            kill_grace: Duration::from_millis(300),
            capture_dir: Some(dir.to_path_buf()),
        })
    }

    fn is_empty_dir(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let result = runner
            .execute(&ExecutionRequest::new(
                "echo out; echo err >&2",
                Duration::from_secs(5),
            ))
            .await;
        assert!(result.success());
        assert!(result.exited_normally());
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn shell_interprets_quoting_and_redirection() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let output = runner
            .run("printf '%s|' 'a b' c | tr '|' ,", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output, "a b,c,");
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let err = runner
            .run("echo partial; echo denied >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::ExecutionFailed("denied\n".into()));

        let err = runner.run("exit 4", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(
            err,
            CommandError::ExecutionFailed("Command failed with status 4".into())
        );
        assert!(is_empty_dir(dir.path()));
    }

    #[tokio::test]
    async fn empty_output_gets_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let output = runner_in(dir.path())
            .run("true", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output, EMPTY_SUCCESS_OUTPUT);
    }

    #[tokio::test]
    async fn empty_command_is_rejected_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner_in(dir.path())
            .run("   ", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::EmptyCommand);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_terminates_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let timeout = Duration::from_secs(1);
        let started = Instant::now();
        let result = runner
            .execute(&ExecutionRequest::new("echo $$; exec sleep 30", timeout))
            .await;
        let elapsed = started.elapsed();

        assert!(result.timed_out());
        assert!(elapsed < timeout + Duration::from_secs(2), "took {elapsed:?}");
        let pid: i32 = result.stdout.trim().parse().unwrap();
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "process {pid} survived the timeout");
        assert!(is_empty_dir(dir.path()));
        assert_eq!(
            result.into_output(),
            Err(CommandError::Timeout { seconds: 1 })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ignored_sigterm_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let started = Instant::now();
        let result = runner
            .execute(&ExecutionRequest::new(
                "trap '' TERM; echo $$; while :; do sleep 1; done",
                Duration::from_millis(300),
            ))
            .await;
        assert!(result.timed_out());
        assert!(started.elapsed() < Duration::from_secs(3));
        let pid: i32 = result.stdout.trim().parse().unwrap();
        assert!(unsafe { libc::kill(pid, 0) } != 0);
    }

    #[tokio::test]
    async fn missing_shell_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(RunnerConfig {
            shell: ShellConfig::new("/nonexistent/shell", vec!["-c".into()]),
            settle: Duration::ZERO,
            kill_grace: Duration::ZERO,
            capture_dir: Some(dir.path().to_path_buf()),
        });
        let result = runner
            .execute(&ExecutionRequest::new("echo hi", Duration::from_secs(1)))
            .await;
        assert!(matches!(result.outcome, ExecutionOutcome::LaunchFailed { .. }));
        assert!(is_empty_dir(dir.path()));
        assert!(matches!(
            result.into_output(),
            Err(CommandError::LaunchFailed(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_invocations_do_not_share_capture_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let (a, b) = tokio::join!(
            runner.run("sleep 0.2; echo first", Duration::from_secs(5)),
            runner.run("echo second", Duration::from_secs(5)),
        );
        assert_eq!(a.unwrap(), "first\n");
        assert_eq!(b.unwrap(), "second\n");
    }
}
