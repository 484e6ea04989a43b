//! Configuration management for efdbui.
//!
//! This module defines the structure of the `efdbui.toml` configuration file,
//! provides functionality to load and parse it, and resolves the optional
//! values into the runtime settings the runner and orchestrator use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use serde::Deserialize;

use crate::action::DEFAULT_ACTION_TIMEOUT;
use crate::fetch::{default_catalog, FetchSpec, DEFAULT_EVENTS_WINDOW_MINUTES, DEFAULT_FETCH_TIMEOUT};
use crate::history::default_history_path;
use crate::orchestrator::{FetchPolicy, DEFAULT_REFRESH_INTERVAL, DEFAULT_SEQUENTIAL_DELAY};
use crate::output::TaskFilter;
use crate::runner::{default_shell_program, RunnerConfig, ShellConfig};
use crate::templates::Binaries;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "efdbui.toml";

/// Top-level configuration structure corresponding to `efdbui.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cluster to target when none is given on the command line.
    pub cluster: Option<String>,
    /// Deployment to target when none is given on the command line.
    pub deployment: Option<String>,
    /// Cluster-management CLI (default: "efdb").
    pub cli_binary: Option<String>,
    /// Remote-execution tool (default: "sanssh").
    pub remote_binary: Option<String>,
    /// Shell used to run commands (default: `$SHELL`).
    pub shell: Option<String>,
    /// Arguments passed to the shell before the command (default: ["-l", "-c"]).
    pub shell_args: Option<Vec<String>>,
    /// Deadline for fetch commands in seconds (default: 60).
    pub fetch_timeout_secs: Option<u64>,
    /// Deadline for actions in seconds (default: 30).
    pub action_timeout_secs: Option<u64>,
    /// Delay before reading captured output in milliseconds (default: 500).
    pub settle_ms: Option<u64>,
    /// Time between SIGTERM and SIGKILL in milliseconds (default: 1000).
    pub kill_grace_ms: Option<u64>,
    /// Auto-refresh period in seconds (default: 30).
    pub refresh_interval_secs: Option<u64>,
    /// Full refresh scheduling ("concurrent" or "sequential").
    pub fetch_policy: Option<String>,
    /// Gap between fetches under the sequential policy (default: 10).
    pub sequential_delay_secs: Option<u64>,
    /// Look-back window for cluster events in minutes (default: 15).
    pub events_window_minutes: Option<i64>,
    /// Path of the command history log (default: ~/EFDBUI/command_history.log).
    pub history_log: Option<PathBuf>,
    /// Whether to write the command history log (default: true).
    pub history: Option<bool>,
    /// Per-operation line limits.
    pub max_lines: Option<HashMap<String, usize>>,
    /// Task filter applied to the tasks output.
    pub task_filter: Option<TaskFilterConfig>,
}

/// The `[task_filter]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFilterConfig {
    /// Hide DELETE_INSTANCE tasks.
    pub exclude_background: Option<bool>,
    /// Comma-separated task types to hide.
    pub custom: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Values resolved from the configuration file and built-in defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cluster: String,
    pub deployment: String,
    pub binaries: Binaries,
    pub shell: ShellConfig,
    pub fetch_timeout: Duration,
    pub action_timeout: Duration,
    pub settle: Duration,
    pub kill_grace: Duration,
    pub refresh_interval: Duration,
    pub policy: FetchPolicy,
    pub events_window: TimeDelta,
    pub history_log: Option<PathBuf>,
    pub max_lines: HashMap<String, usize>,
    pub task_filter: TaskFilter,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let sequential_delay = config
            .sequential_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SEQUENTIAL_DELAY);
        let policy = match config.fetch_policy.as_deref() {
            None | Some("concurrent") => FetchPolicy::Concurrent,
            Some("sequential") => FetchPolicy::Sequential {
                delay: sequential_delay,
            },
            Some(other) => bail!("unknown fetch_policy {other:?} (expected \"concurrent\" or \"sequential\")"),
        };

        let history_enabled = config.history.unwrap_or(true);
        let history_log = if history_enabled {
            config.history_log.clone().or_else(default_history_path)
        } else {
            None
        };

        let task_filter = config
            .task_filter
            .as_ref()
            .map(|filter| {
                TaskFilter::new(
                    filter.exclude_background.unwrap_or(false),
                    filter.custom.clone().unwrap_or_default(),
                )
            })
            .unwrap_or_default();

        let defaults = Binaries::default();
        Ok(Self {
            cluster: config.cluster.clone().unwrap_or_default(),
            deployment: config.deployment.clone().unwrap_or_default(),
            binaries: Binaries::new(
                config.cli_binary.clone().unwrap_or(defaults.cli),
                config.remote_binary.clone().unwrap_or(defaults.remote),
            ),
            shell: ShellConfig::new(
                config.shell.clone().unwrap_or_else(default_shell_program),
                config
                    .shell_args
                    .clone()
                    .unwrap_or_else(|| vec!["-l".to_string(), "-c".to_string()]),
            ),
            fetch_timeout: secs_or(config.fetch_timeout_secs, DEFAULT_FETCH_TIMEOUT),
            action_timeout: secs_or(config.action_timeout_secs, DEFAULT_ACTION_TIMEOUT),
            settle: config
                .settle_ms
                .map(Duration::from_millis)
                .unwrap_or(RunnerConfig::default().settle),
            kill_grace: config
                .kill_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(RunnerConfig::default().kill_grace),
            refresh_interval: secs_or(config.refresh_interval_secs, DEFAULT_REFRESH_INTERVAL),
            policy,
            events_window: TimeDelta::minutes(
                config
                    .events_window_minutes
                    .unwrap_or(DEFAULT_EVENTS_WINDOW_MINUTES),
            ),
            history_log,
            max_lines: config.max_lines.clone().unwrap_or_default(),
            task_filter,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            shell: self.shell.clone(),
            settle: self.settle,
            kill_grace: self.kill_grace,
            capture_dir: None,
        }
    }

    /// The standard fetch catalog with configured deadlines and line limits.
    pub fn fetches(&self) -> Vec<FetchSpec> {
        default_catalog()
            .into_iter()
            .map(|spec| {
                let max_lines = self.max_lines.get(&spec.name).copied().unwrap_or(0);
                spec.with_timeout(self.fetch_timeout).with_max_lines(max_lines)
            })
            .collect()
    }
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}
