//! Command template registry.
//!
//! A `CommandTemplate` turns a map of operator-supplied arguments into a
//! single shell command line. Templates are built once for a cluster and
//! deployment pair and never change afterwards. Rendering performs no I/O;
//! it validates identifier-like values against an allow-list and quotes
//! free-text values before they are embedded into shell text.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;

use crate::process::ClusterTarget;

/// Allow-list for cluster and deployment names.
const CLUSTER_NAME_PATTERN: &str = r"^[A-Za-z0-9_-]+$";
/// Allow-list for machine addresses, task ids and instance ids.
const IDENTIFIER_PATTERN: &str = r"^[A-Za-z0-9_.:-]+$";

/// Reasons a template refused to produce a command line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown command template '{0}'")]
    UnknownTemplate(String),
    #[error("missing required argument '{0}'")]
    MissingArgument(String),
    #[error("invalid {label}: '{value}'")]
    InvalidArgument { label: String, value: String },
}

/// Describes one named input slot consumed by a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentSpec {
    pub key: String,
    pub label: String,
    pub placeholder: String,
    pub is_required: bool,
    pub help_text: Option<String>,
}

impl ArgumentSpec {
    /// Creates a required argument.
    pub fn required(key: &str, label: &str, placeholder: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            placeholder: placeholder.to_string(),
            is_required: true,
            help_text: None,
        }
    }

    /// Creates an optional argument.
    pub fn optional(key: &str, label: &str, placeholder: &str) -> Self {
        Self {
            is_required: false,
            ..Self::required(key, label, placeholder)
        }
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help_text = Some(help.to_string());
        self
    }
}

/// Pure function from an argument map to a command line.
pub type RenderFn =
    Arc<dyn Fn(&HashMap<String, String>) -> Result<String, TemplateError> + Send + Sync>;

/// A parameterized command descriptor.
#[derive(Clone)]
pub struct CommandTemplate {
    /// Stable identifier used to look the template up (e.g. `pause`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub description: String,
    pub arguments: Vec<ArgumentSpec>,
    /// Affects confirmation wording only.
    pub is_destructive: bool,
    /// Informational; does not block execution.
    pub is_implemented: bool,
    render: RenderFn,
}

impl fmt::Debug for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTemplate")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("is_destructive", &self.is_destructive)
            .field("is_implemented", &self.is_implemented)
            .finish_non_exhaustive()
    }
}

impl CommandTemplate {
    pub fn new<F>(id: &str, name: &str, description: &str, render: F) -> Self
    where
        F: Fn(&HashMap<String, String>) -> Result<String, TemplateError> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            arguments: Vec::new(),
            is_destructive: false,
            is_implemented: true,
            render: Arc::new(render),
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<ArgumentSpec>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn destructive(mut self) -> Self {
        self.is_destructive = true;
        self
    }

    pub fn unimplemented(mut self) -> Self {
        self.is_implemented = false;
        self
    }

    /// Whether the caller must collect arguments before rendering.
    pub fn requires_arguments(&self) -> bool {
        !self.arguments.is_empty()
    }

    /// Renders the command line, reporting why it could not be built.
    ///
    /// Required arguments that are absent or blank fail with
    /// `MissingArgument` before the render function runs. Keys that no
    /// argument spec names are ignored.
    pub fn try_render(&self, args: &HashMap<String, String>) -> Result<String, TemplateError> {
        for spec in self.arguments.iter().filter(|spec| spec.is_required) {
            let present = args
                .get(&spec.key)
                .is_some_and(|value| !value.trim().is_empty());
            if !present {
                return Err(TemplateError::MissingArgument(spec.key.clone()));
            }
        }
        (self.render)(args)
    }

    /// Renders the command line, or returns an empty string when it cannot
    /// be built. An empty result means "do not execute".
    pub fn render(&self, args: &HashMap<String, String>) -> String {
        self.try_render(args).unwrap_or_default()
    }

    /// Question shown to the operator before executing `command`.
    pub fn confirmation_prompt(&self, command: &str) -> String {
        if self.is_destructive {
            format!("DESTRUCTIVE: {}\n  {command}\nExecute anyway? [y/N] ", self.name)
        } else {
            format!("{}\n  {command}\nExecute? [y/N] ", self.name)
        }
    }
}

/// External programs the templates shell out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binaries {
    /// Cluster-management CLI (`efdb`).
    pub cli: String,
    /// Remote-execution tool (`sanssh`).
    pub remote: String,
}

impl Binaries {
    pub fn new(cli: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            remote: remote.into(),
        }
    }
}

impl Default for Binaries {
    fn default() -> Self {
        Self::new("efdb", "sanssh")
    }
}

/// Holds the fixed catalog of action templates for one cluster target.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: Vec<CommandTemplate>,
}

impl TemplateRegistry {
    /// Wraps an explicit list of templates.
    pub fn new(templates: Vec<CommandTemplate>) -> Self {
        Self { templates }
    }

    /// Builds the standard action catalog for `target`.
    pub fn for_target(target: &ClusterTarget, binaries: &Binaries) -> Self {
        Self::new(action_catalog(target, binaries))
    }

    pub fn get(&self, id: &str) -> Option<&CommandTemplate> {
        self.templates.iter().find(|template| template.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandTemplate> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn try_render(
        &self,
        id: &str,
        args: &HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        self.get(id)
            .ok_or_else(|| TemplateError::UnknownTemplate(id.to_string()))?
            .try_render(args)
    }

    /// Renders template `id`; unknown ids and invalid input yield "".
    pub fn render(&self, id: &str, args: &HashMap<String, String>) -> String {
        self.try_render(id, args).unwrap_or_default()
    }
}

fn cluster_name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CLUSTER_NAME_PATTERN).ok()).as_ref()
}

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(IDENTIFIER_PATTERN).ok()).as_ref()
}

/// Returns true if `name` is an acceptable cluster or deployment name.
pub fn is_valid_cluster_name(name: &str) -> bool {
    cluster_name_regex().is_some_and(|re| re.is_match(name))
}

/// Checks a cluster/deployment name against the allow-list.
pub fn validate_cluster_name<'a>(label: &str, value: &'a str) -> Result<&'a str, TemplateError> {
    let value = value.trim();
    if is_valid_cluster_name(value) {
        Ok(value)
    } else {
        Err(TemplateError::InvalidArgument {
            label: label.to_string(),
            value: value.to_string(),
        })
    }
}

/// Checks a machine/task/instance identifier against the allow-list.
pub fn validate_identifier<'a>(label: &str, value: &'a str) -> Result<&'a str, TemplateError> {
    let value = value.trim();
    if identifier_regex().is_some_and(|re| re.is_match(value)) {
        Ok(value)
    } else {
        Err(TemplateError::InvalidArgument {
            label: label.to_string(),
            value: value.to_string(),
        })
    }
}

fn required_identifier<'a>(
    args: &'a HashMap<String, String>,
    key: &str,
    label: &str,
) -> Result<&'a str, TemplateError> {
    let value = args
        .get(key)
        .ok_or_else(|| TemplateError::MissingArgument(key.to_string()))?;
    validate_identifier(label, value)
}

fn optional_text<'a>(args: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    args.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn action_catalog(target: &ClusterTarget, binaries: &Binaries) -> Vec<CommandTemplate> {
    let cli = binaries.cli.clone();
    let remote = binaries.remote.clone();
    let cluster = target.cluster.trim().to_string();
    let deployment = target.deployment.trim().to_string();

    let machine_arg = || {
        ArgumentSpec::required("machine", "Machine IP/ID", "10.0.0.1 or machine-id")
    };

    vec![
        {
            let (cli, cluster) = (cli.clone(), cluster.clone());
            CommandTemplate::new(
                "exclude-machine",
                "Exclude Machine",
                "Remove a machine from the cluster",
                move |args| {
                    let cluster = validate_cluster_name("cluster name", &cluster)?;
                    let machine = required_identifier(args, "machine", "machine")?;
                    Ok(format!("{cli} cluster exclude {cluster} {machine}"))
                },
            )
            .with_arguments(vec![
                machine_arg().with_help("The IP address or ID of the machine to exclude")
            ])
            .destructive()
        },
        {
            let (cli, cluster) = (cli.clone(), cluster.clone());
            CommandTemplate::new(
                "include-machine",
                "Include Machine",
                "Add a machine back to the cluster",
                move |args| {
                    let cluster = validate_cluster_name("cluster name", &cluster)?;
                    let machine = required_identifier(args, "machine", "machine")?;
                    Ok(format!("{cli} cluster include {cluster} {machine}"))
                },
            )
            .with_arguments(vec![
                machine_arg().with_help("The IP address or ID of the machine to include")
            ])
        },
        cluster_verb(
            &cli,
            &cluster,
            "stop-topology-change",
            "Stop Topology Change",
            "Prevent topology changes in the cluster",
        )
        .destructive(),
        cluster_verb(&cli, &cluster, "pause", "Pause Cluster", "Pause the cluster operations")
            .destructive(),
        cluster_verb(&cli, &cluster, "unpause", "Unpause Cluster", "Resume cluster operations"),
        {
            let (cli, cluster) = (cli.clone(), cluster.clone());
            CommandTemplate::new(
                "abort-task",
                "Abort Task",
                "Abort a running cluster task",
                move |args| {
                    let cluster = validate_cluster_name("cluster name", &cluster)?;
                    let task = required_identifier(args, "task_id", "task id")?;
                    let mut command = format!("{cli} cluster abort-task {cluster} {task}");
                    if let Some(reason) = optional_text(args, "reason") {
                        command.push_str(" --reason ");
                        command.push_str(&shell_words::quote(reason));
                    }
                    Ok(command)
                },
            )
            .with_arguments(vec![
                ArgumentSpec::required("task_id", "Task ID", "task-1234")
                    .with_help("Identifier shown in the show-all-tasks output"),
                ArgumentSpec::optional("reason", "Reason", "why the task is aborted"),
            ])
            .destructive()
        },
        CommandTemplate::new(
            "mark-unreachable",
            "Mark Instance Unreachable",
            "Mark an instance unreachable through the remote-execution tool",
            move |args| {
                let deployment = validate_cluster_name("deployment name", &deployment)?;
                let cluster = validate_cluster_name("cluster name", &cluster)?;
                let instance = required_identifier(args, "instance", "instance")?;
                let justification = optional_text(args, "justification")
                    .ok_or_else(|| TemplateError::MissingArgument("justification".into()))?;
                Ok(format!(
                    "{remote} --targets={deployment} {cli} instance mark-unreachable \
                     --cluster={cluster} --instance={instance} --justification={}",
                    shell_words::quote(justification)
                ))
            },
        )
        .with_arguments(vec![
            ArgumentSpec::required("instance", "Instance ID", "instance-id"),
            ArgumentSpec::required("justification", "Justification", "ticket or reason")
                .with_help("Free text recorded with the change"),
        ])
        .destructive()
        .unimplemented(),
    ]
}

// Template for `<cli> cluster <verb> <cluster>` commands without arguments.
fn cluster_verb(
    cli: &str,
    cluster: &str,
    verb: &'static str,
    name: &str,
    description: &str,
) -> CommandTemplate {
    let (cli, cluster) = (cli.to_string(), cluster.to_string());
    CommandTemplate::new(verb, name, description, move |_| {
        let cluster = validate_cluster_name("cluster name", &cluster)?;
        Ok(format!("{cli} cluster {verb} {cluster}"))
    })
}
