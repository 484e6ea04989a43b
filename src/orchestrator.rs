//! Fetch orchestration.
//!
//! The `FetchOrchestrator` owns one `FetchState` per named fetch operation
//! and drives them: single fetches, full refreshes (concurrent or staggered),
//! the auto-refresh timer, the task filter, search and ad hoc actions.
//!
//! Each operation has its own async lock, so at most one run of a given
//! operation mutates its state at a time. Fetch bodies run on their own task;
//! a panic there is reported as a failure instead of leaving the state stuck
//! in `Loading`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{Local, TimeDelta};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::action::{ActionExecutor, DEFAULT_ACTION_TIMEOUT};
use crate::error::CommandError;
use crate::events::FetchEvent;
use crate::fetch::{default_catalog, FetchContext, FetchSpec, DEFAULT_EVENTS_WINDOW_MINUTES};
use crate::history::HistoryLog;
use crate::output::{count_matches, filter_tasks, format_command_output, truncate_lines, TaskFilter};
use crate::process::{ClusterTarget, FetchState};
use crate::runner::ProcessRunner;
use crate::templates::{Binaries, TemplateError, TemplateRegistry};

/// Default auto-refresh period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Default gap between fetches under the sequential policy.
pub const DEFAULT_SEQUENTIAL_DELAY: Duration = Duration::from_secs(10);
/// Refresh periods below this are raised to it.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(50);

/// How `run_all` schedules the operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Every operation starts at once.
    #[default]
    Concurrent,
    /// One at a time in catalog order, with `delay` between starts.
    Sequential { delay: Duration },
}

/// Current auto-refresh setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoRefresh {
    pub enabled: bool,
    pub interval: Duration,
}

/// Per-operation match counts for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResults {
    pub query: String,
    pub matches: BTreeMap<String, usize>,
}

impl SearchResults {
    pub fn total(&self) -> usize {
        self.matches.values().sum()
    }

    pub fn count(&self, op: &str) -> usize {
        self.matches.get(op).copied().unwrap_or(0)
    }
}

/// Construction parameters for [`FetchOrchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub target: ClusterTarget,
    pub binaries: Binaries,
    pub fetches: Vec<FetchSpec>,
    pub policy: FetchPolicy,
    pub events_window: TimeDelta,
    pub action_timeout: Duration,
    pub task_filter: TaskFilter,
    pub history: Option<Arc<HistoryLog>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            target: ClusterTarget::default(),
            binaries: Binaries::default(),
            fetches: default_catalog(),
            policy: FetchPolicy::default(),
            events_window: TimeDelta::minutes(DEFAULT_EVENTS_WINDOW_MINUTES),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            task_filter: TaskFilter::default(),
            history: None,
        }
    }
}

struct RefreshTimer {
    interval: Duration,
    handle: JoinHandle<()>,
}

struct Shared {
    runner: ProcessRunner,
    actions: ActionExecutor,
    history: Option<Arc<HistoryLog>>,
    binaries: Binaries,
    fetches: Vec<FetchSpec>,
    policy: FetchPolicy,
    events_window: TimeDelta,
    target: Mutex<ClusterTarget>,
    states: Mutex<HashMap<String, FetchState>>,
    // Unfiltered display text of filterable operations.
    unfiltered: Mutex<HashMap<String, String>>,
    task_filter: Mutex<TaskFilter>,
    run_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    refresh: Mutex<Option<RefreshTimer>>,
    events: Mutex<Option<mpsc::UnboundedSender<FetchEvent>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.refresh).take() {
            timer.handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Completion {
    Succeeded {
        command: String,
        display: String,
    },
    Failed {
        command: Option<String>,
        display: String,
        error: String,
    },
}

/// Drives the named fetch operations for one cluster target.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct FetchOrchestrator {
    shared: Arc<Shared>,
}

impl FetchOrchestrator {
    pub fn new(runner: ProcessRunner, config: OrchestratorConfig) -> Self {
        let mut actions = ActionExecutor::new(runner.clone(), config.action_timeout);
        if let Some(history) = &config.history {
            actions = actions.with_history(history.clone());
        }
        let states = config
            .fetches
            .iter()
            .map(|spec| (spec.name.clone(), FetchState::default()))
            .collect();
        let run_locks = config
            .fetches
            .iter()
            .map(|spec| (spec.name.clone(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            shared: Arc::new(Shared {
                runner,
                actions,
                history: config.history,
                binaries: config.binaries,
                fetches: config.fetches,
                policy: config.policy,
                events_window: config.events_window,
                target: Mutex::new(config.target),
                states: Mutex::new(states),
                unfiltered: Mutex::new(HashMap::new()),
                task_filter: Mutex::new(config.task_filter),
                run_locks,
                refresh: Mutex::new(None),
                events: Mutex::new(None),
            }),
        }
    }

    /// Returns a receiver for orchestrator events. A later call replaces the
    /// earlier subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FetchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.events) = Some(tx);
        rx
    }

    fn emit(&self, event: FetchEvent) {
        let mut events = lock(&self.shared.events);
        if let Some(tx) = events.as_ref() {
            if tx.send(event).is_err() {
                *events = None;
            }
        }
    }

    pub fn target(&self) -> ClusterTarget {
        lock(&self.shared.target).clone()
    }

    /// Changes the target used by subsequent fetches and templates.
    pub fn set_target(&self, target: ClusterTarget) {
        *lock(&self.shared.target) = target;
    }

    pub fn policy(&self) -> FetchPolicy {
        self.shared.policy
    }

    /// Names of the configured operations, in catalog order.
    pub fn fetch_names(&self) -> Vec<String> {
        self.shared
            .fetches
            .iter()
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn state(&self, op: &str) -> Option<FetchState> {
        lock(&self.shared.states).get(op).cloned()
    }

    /// All states, in catalog order.
    pub fn states(&self) -> Vec<(String, FetchState)> {
        let states = lock(&self.shared.states);
        self.shared
            .fetches
            .iter()
            .map(|spec| {
                let state = states.get(&spec.name).cloned().unwrap_or_default();
                (spec.name.clone(), state)
            })
            .collect()
    }

    fn spec(&self, op: &str) -> Option<&FetchSpec> {
        self.shared.fetches.iter().find(|spec| spec.name == op)
    }

    fn update_state(&self, op: &str, update: impl FnOnce(&mut FetchState)) -> FetchState {
        let mut states = lock(&self.shared.states);
        let state = states.entry(op.to_string()).or_default();
        update(state);
        state.clone()
    }

    /// Runs one named operation to completion and returns its terminal
    /// state, or `None` if no operation has that name.
    ///
    /// The fetch runs on its own task from `Loading` to its terminal state,
    /// so dropping the returned future does not leave the state loading.
    pub async fn run_fetch(&self, op: &str) -> Option<FetchState> {
        self.spec(op)?;
        let this = self.clone();
        let name = op.to_string();
        match tokio::spawn(async move { this.drive_fetch(&name).await }).await {
            Ok(state) => state,
            Err(err) => {
                warn!(op, "fetch task failed: {err}");
                self.state(op)
            }
        }
    }

    async fn drive_fetch(&self, op: &str) -> Option<FetchState> {
        let spec = self.spec(op)?.clone();
        let run_lock = self.shared.run_locks.get(op)?.clone();
        let _running = run_lock.lock().await;

        self.update_state(op, FetchState::begin);
        self.emit(FetchEvent::FetchStarted { op: op.to_string() });

        let this = self.clone();
        let body_spec = spec.clone();
        let completion = match tokio::spawn(async move { this.perform(&body_spec).await }).await {
            Ok(completion) => completion,
            Err(err) => {
                warn!(op, "fetch body failed: {err}");
                let error = CommandError::ExecutionFailed(format!("fetch task failed: {err}"));
                Completion::Failed {
                    command: None,
                    display: failure_display(&spec, &self.target(), None, &error),
                    error: error.to_string(),
                }
            }
        };

        let state = self.complete(&spec, completion);
        self.emit(FetchEvent::FetchFinished {
            op: op.to_string(),
            status: state.status,
        });
        Some(state)
    }

    async fn perform(&self, spec: &FetchSpec) -> Completion {
        let target = self.target();
        if let Err(err) = spec.precheck(&target) {
            debug!(op = %spec.name, "fetch skipped: {err}");
            return Completion::Failed {
                command: None,
                display: error_stub(&err),
                error: err.to_string(),
            };
        }

        let context = FetchContext {
            target: &target,
            binaries: &self.shared.binaries,
            events_window: self.shared.events_window,
            now: Local::now(),
        };
        let command = match spec.build_command(&context) {
            Ok(command) => command,
            Err(err) => {
                warn!(op = %spec.name, "failed to build command: {err}");
                return Completion::Failed {
                    command: None,
                    display: failure_display(spec, &target, None, &err),
                    error: err.to_string(),
                };
            }
        };

        info!(op = %spec.name, command = %command, "fetching");
        match self.shared.runner.run(&command, spec.timeout).await {
            Ok(output) => {
                let output = truncate_lines(&output, spec.max_lines);
                self.record_history(&command, &output, None).await;
                Completion::Succeeded {
                    display: format_command_output(&command, &output),
                    command,
                }
            }
            Err(err) => {
                warn!(op = %spec.name, "fetch failed: {err}");
                let error = err.to_string();
                self.record_history(&command, "", Some(&error)).await;
                Completion::Failed {
                    display: failure_display(spec, &target, Some(&command), &err),
                    command: Some(command),
                    error,
                }
            }
        }
    }

    async fn record_history(&self, command: &str, output: &str, error: Option<&str>) {
        if let Some(history) = &self.shared.history {
            history
                .clone()
                .record_async(command.to_string(), output.to_string(), error.map(str::to_string))
                .await;
        }
    }

    // Writes to a filterable operation's state happen with the task filter
    // locked, so a concurrent `apply_task_filter` cannot be overwritten by
    // output filtered with the previous filter.
    fn complete(&self, spec: &FetchSpec, completion: Completion) -> FetchState {
        let filter = spec.filterable.then(|| lock(&self.shared.task_filter));
        match completion {
            Completion::Succeeded { command, display } => {
                let display = match &filter {
                    Some(filter) => {
                        lock(&self.shared.unfiltered).insert(spec.name.clone(), display.clone());
                        filter_tasks(&display, filter)
                    }
                    None => display,
                };
                self.update_state(&spec.name, |state| state.succeed(command, display))
            }
            Completion::Failed {
                command,
                display,
                error,
            } => {
                if filter.is_some() {
                    lock(&self.shared.unfiltered).insert(spec.name.clone(), display.clone());
                }
                self.update_state(&spec.name, |state| state.fail(command, display, error))
            }
        }
    }

    /// Runs every operation under the configured policy and returns once
    /// all of them are terminal.
    pub async fn run_all(&self) {
        let names = self.fetch_names();
        match self.shared.policy {
            FetchPolicy::Concurrent => {
                let mut set = JoinSet::new();
                for name in names {
                    let this = self.clone();
                    set.spawn(async move {
                        this.run_fetch(&name).await;
                    });
                }
                while let Some(joined) = set.join_next().await {
                    if let Err(err) = joined {
                        warn!("fetch task failed: {err}");
                    }
                }
            }
            FetchPolicy::Sequential { delay } => {
                for (index, name) in names.iter().enumerate() {
                    if index > 0 && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    self.run_fetch(name).await;
                }
            }
        }
    }

    /// Starts the refresh timer, replacing any running one. The first
    /// refresh happens one `interval` from now. Must be called inside a
    /// Tokio runtime.
    pub fn enable_auto_refresh(&self, interval: Duration) {
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(refresh_loop(weak, interval));
        let previous = lock(&self.shared.refresh).replace(RefreshTimer { interval, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        info!(interval_secs = interval.as_secs_f64(), "auto-refresh enabled");
    }

    /// Stops the refresh timer. A refresh already in progress runs to
    /// completion.
    pub fn disable_auto_refresh(&self) {
        if let Some(timer) = lock(&self.shared.refresh).take() {
            timer.handle.abort();
            info!("auto-refresh disabled");
        }
    }

    pub fn auto_refresh(&self) -> Option<AutoRefresh> {
        lock(&self.shared.refresh).as_ref().map(|timer| AutoRefresh {
            enabled: true,
            interval: timer.interval,
        })
    }

    pub fn is_auto_refresh_enabled(&self) -> bool {
        self.auto_refresh().is_some()
    }

    pub fn task_filter(&self) -> TaskFilter {
        lock(&self.shared.task_filter).clone()
    }

    /// Stores `filter` and re-filters the last unfiltered tasks output.
    ///
    /// The filter is kept even when nothing has been fetched yet, in which
    /// case `NoTasksLoaded` is returned; it applies to the next fetch.
    pub fn apply_task_filter(&self, filter: TaskFilter) -> Result<(), CommandError> {
        let mut active = lock(&self.shared.task_filter);
        *active = filter;
        let unfiltered = lock(&self.shared.unfiltered).clone();
        let mut applied = false;
        for spec in self.shared.fetches.iter().filter(|spec| spec.filterable) {
            let Some(text) = unfiltered.get(&spec.name) else {
                continue;
            };
            let filtered = filter_tasks(text, &active);
            self.update_state(&spec.name, |state| state.last_output = filtered);
            applied = true;
        }
        drop(active);
        if applied {
            Ok(())
        } else {
            Err(CommandError::NoTasksLoaded)
        }
    }

    /// Counts case-insensitive matches of the trimmed `query` in every
    /// operation's current output.
    pub fn search(&self, query: &str) -> SearchResults {
        let query = query.trim();
        let matches = self
            .states()
            .into_iter()
            .map(|(op, state)| (op, count_matches(&state.last_output, query)))
            .collect();
        SearchResults {
            query: query.to_string(),
            matches,
        }
    }

    /// Resets every operation to idle and forgets stored task output.
    pub fn clear(&self) {
        let _filter = lock(&self.shared.task_filter);
        let mut states = lock(&self.shared.states);
        for state in states.values_mut() {
            *state = FetchState::default();
        }
        lock(&self.shared.unfiltered).clear();
    }

    /// Action templates bound to the current target.
    pub fn templates(&self) -> TemplateRegistry {
        TemplateRegistry::for_target(&self.target(), &self.shared.binaries)
    }

    pub fn render_action(
        &self,
        template_id: &str,
        args: &HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        self.templates().try_render(template_id, args)
    }

    /// Runs an ad hoc action command line.
    pub async fn execute_action(&self, command_line: &str) -> Result<String, CommandError> {
        let result = self.shared.actions.execute(command_line).await;
        self.emit(FetchEvent::ActionFinished {
            command: command_line.to_string(),
            success: result.is_ok(),
        });
        result
    }
}

async fn refresh_loop(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let orchestrator = FetchOrchestrator { shared };
        debug!("auto-refresh tick");
        orchestrator.emit(FetchEvent::RefreshTick);
        // The refresh runs on its own task so that aborting this loop does
        // not cancel fetches in flight.
        let refresh = tokio::spawn(async move { orchestrator.run_all().await });
        if let Err(err) = refresh.await {
            warn!("auto-refresh failed: {err}");
        }
    }
}

fn error_stub(err: &CommandError) -> String {
    json!({ "error": err.to_string() }).to_string()
}

fn failure_display(
    spec: &FetchSpec,
    target: &ClusterTarget,
    command: Option<&str>,
    err: &CommandError,
) -> String {
    let body = json!({
        "error": format!("Failed to fetch {}", spec.title),
        "details": err.to_string(),
        "cluster": target.cluster,
    });
    let body = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
    match command {
        Some(command) => format_command_output(command, &body),
        None => body,
    }
}
