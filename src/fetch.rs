//! Named fetch operations.
//!
//! A `FetchSpec` describes one read-only query the orchestrator can run
//! (cluster info, status, tasks, events): how to build its command line
//! from the current target, which inputs it requires, its deadline and its
//! line limit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};

use crate::error::CommandError;
use crate::process::ClusterTarget;
use crate::templates::{is_valid_cluster_name, Binaries};

pub const OP_INFO: &str = "info";
pub const OP_STATUS: &str = "status";
pub const OP_TASKS: &str = "tasks";
pub const OP_EVENTS: &str = "events";

/// Default deadline for fetch commands.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Default look-back window for cluster events.
pub const DEFAULT_EVENTS_WINDOW_MINUTES: i64 = 15;

const EVENTS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Inputs available when a fetch command is built.
#[derive(Debug, Clone)]
pub struct FetchContext<'a> {
    pub target: &'a ClusterTarget,
    pub binaries: &'a Binaries,
    pub events_window: TimeDelta,
    pub now: DateTime<Local>,
}

pub type BuildFn = Arc<dyn Fn(&FetchContext<'_>) -> Result<String, CommandError> + Send + Sync>;

/// Description of one named fetch operation.
#[derive(Clone)]
pub struct FetchSpec {
    pub name: String,
    /// Used in failure messages ("Failed to fetch <title>").
    pub title: String,
    pub requires_deployment: bool,
    /// Whether the task filter applies to this operation's output.
    pub filterable: bool,
    pub timeout: Duration,
    /// 0 = unlimited.
    pub max_lines: usize,
    build: BuildFn,
}

impl fmt::Debug for FetchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchSpec")
            .field("name", &self.name)
            .field("title", &self.title)
            .field("requires_deployment", &self.requires_deployment)
            .field("filterable", &self.filterable)
            .field("timeout", &self.timeout)
            .field("max_lines", &self.max_lines)
            .finish_non_exhaustive()
    }
}

impl FetchSpec {
    pub fn new<F>(name: &str, title: &str, build: F) -> Self
    where
        F: Fn(&FetchContext<'_>) -> Result<String, CommandError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            requires_deployment: false,
            filterable: false,
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_lines: 0,
            build: Arc::new(build),
        }
    }

    pub fn requires_deployment(mut self) -> Self {
        self.requires_deployment = true;
        self
    }

    pub fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    /// Rejects a target that lacks the identifiers this operation needs.
    pub fn precheck(&self, target: &ClusterTarget) -> Result<(), CommandError> {
        if !target.has_cluster() {
            return Err(CommandError::Validation("Cluster name is required".into()));
        }
        if self.requires_deployment && !target.has_deployment() {
            return Err(CommandError::Validation(
                "Deployment name is required for cluster events".into(),
            ));
        }
        Ok(())
    }

    pub fn build_command(&self, context: &FetchContext<'_>) -> Result<String, CommandError> {
        (self.build)(context)
    }
}

fn checked_cluster(target: &ClusterTarget) -> Result<&str, CommandError> {
    let cluster = target.cluster.trim();
    if is_valid_cluster_name(cluster) {
        Ok(cluster)
    } else {
        Err(CommandError::Validation("Invalid cluster name format".into()))
    }
}

fn checked_deployment(target: &ClusterTarget) -> Result<&str, CommandError> {
    let deployment = target.deployment.trim();
    if is_valid_cluster_name(deployment) {
        Ok(deployment)
    } else {
        Err(CommandError::Validation("Invalid deployment name format".into()))
    }
}

fn cluster_query(name: &str, title: &str, action: &'static str) -> FetchSpec {
    FetchSpec::new(name, title, move |context| {
        let cluster = checked_cluster(context.target)?;
        Ok(format!("{} cluster {action} {cluster}", context.binaries.cli))
    })
}

/// Command that queries cluster events between `now - window` and `now`.
pub fn events_command(context: &FetchContext<'_>) -> Result<String, CommandError> {
    let cluster = checked_cluster(context.target)?;
    let deployment = checked_deployment(context.target)?;
    let to = context.now;
    let from = to - context.events_window;
    let query = format!(
        "select SYSTEM\\$EFDB_GET_CLUSTER_EVENTS('{cluster}', true, '{}', '{}');",
        from.format(EVENTS_TIME_FORMAT),
        to.format(EVENTS_TIME_FORMAT)
    );
    Ok(format!(
        "{} account --account={deployment} exec --query \"{query}\"",
        context.binaries.cli
    ))
}

/// The standard four operations, in display order.
pub fn default_catalog() -> Vec<FetchSpec> {
    vec![
        cluster_query(OP_INFO, "cluster information", "info"),
        cluster_query(OP_STATUS, "status JSON", "status-json"),
        cluster_query(OP_TASKS, "tasks", "show-all-tasks").filterable(),
        FetchSpec::new(OP_EVENTS, "cluster events", events_command).requires_deployment(),
    ]
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn context<'a>(target: &'a ClusterTarget, binaries: &'a Binaries) -> FetchContext<'a> {
        FetchContext {
            target,
            binaries,
            events_window: TimeDelta::minutes(DEFAULT_EVENTS_WINDOW_MINUTES),
            now: Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    fn spec(name: &str) -> FetchSpec {
        default_catalog()
            .into_iter()
            .find(|spec| spec.name == name)
            .unwrap()
    }

    #[test]
    fn builds_cluster_queries() {
        let target = ClusterTarget::new("prod1fdb2", "prod1");
        let binaries = Binaries::default();
        let ctx = context(&target, &binaries);
        assert_eq!(
            spec(OP_INFO).build_command(&ctx).unwrap(),
            "efdb cluster info prod1fdb2"
        );
        assert_eq!(
            spec(OP_STATUS).build_command(&ctx).unwrap(),
            "efdb cluster status-json prod1fdb2"
        );
        assert_eq!(
            spec(OP_TASKS).build_command(&ctx).unwrap(),
            "efdb cluster show-all-tasks prod1fdb2"
        );
    }

    #[test]
    fn builds_events_query_with_time_window() {
        let target = ClusterTarget::new("prod1fdb2", "prod1");
        let binaries = Binaries::default();
        let command = spec(OP_EVENTS)
            .build_command(&context(&target, &binaries))
            .unwrap();
        assert_eq!(
            command,
            "efdb account --account=prod1 exec --query \"select SYSTEM\\$EFDB_GET_CLUSTER_EVENTS(\
             'prod1fdb2', true, '2024-05-01 12:15:00.000', '2024-05-01 12:30:00.000');\""
        );
    }

    #[test]
    fn precheck_requires_identifiers() {
        let events = spec(OP_EVENTS);
        assert_eq!(
            events.precheck(&ClusterTarget::new("  ", "prod1")),
            Err(CommandError::Validation("Cluster name is required".into()))
        );
        assert_eq!(
            events.precheck(&ClusterTarget::new("c1", "")),
            Err(CommandError::Validation(
                "Deployment name is required for cluster events".into()
            ))
        );
        assert!(spec(OP_INFO).precheck(&ClusterTarget::new("c1", "")).is_ok());
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let target = ClusterTarget::new("c1; rm -rf ~", "prod1");
        let binaries = Binaries::default();
        let err = spec(OP_INFO)
            .build_command(&context(&target, &binaries))
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::Validation("Invalid cluster name format".into())
        );
        let target = ClusterTarget::new("c1", "prod1'");
        assert!(spec(OP_EVENTS)
            .build_command(&context(&target, &binaries))
            .is_err());
    }

    #[test]
    fn catalog_flags() {
        let catalog = default_catalog();
        let names: Vec<&str> = catalog.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, vec![OP_INFO, OP_STATUS, OP_TASKS, OP_EVENTS]);
        assert!(spec(OP_TASKS).filterable);
        assert!(spec(OP_EVENTS).requires_deployment);
        assert_eq!(spec(OP_INFO).timeout, DEFAULT_FETCH_TIMEOUT);
    }
}
