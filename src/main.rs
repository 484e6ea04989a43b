//! efdbui: cluster operations from the terminal.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, and dispatches to the fetch, watch,
//! action and template subcommands.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use efdbui::config::{load_config, Config, Settings, CONFIG_FILE_NAME};
use efdbui::{
    ClusterTarget, FetchEvent, FetchOrchestrator, FetchPolicy, FetchState, FetchStatus,
    HistoryLog, OrchestratorConfig, ProcessRunner, TaskFilter,
};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "efdbui",
    version,
    about = "Run efdb and sanssh cluster commands with timeouts and history",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to efdbui.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any efdbui.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Cluster name (e.g. prod1fdb2).
    #[arg(long, short = 'c', global = true)]
    cluster: Option<String>,
    /// Deployment name (e.g. prod1); needed for cluster events and sanssh.
    #[arg(long, short = 'd', global = true)]
    deployment: Option<String>,
    /// Do not write the command history log.
    #[arg(long, global = true)]
    no_history: bool,
    /// Tracing filter for diagnostics on stderr (e.g. "debug", "efdbui=trace").
    #[arg(long, global = true, default_value = "warn")]
    log_filter: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run fetch operations once and print their output.
    Fetch {
        /// Operations to run (info, status, tasks, events); all when omitted.
        ops: Vec<String>,
        /// Run one operation at a time instead of all at once.
        #[arg(long)]
        sequential: bool,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Refresh all operations periodically until interrupted.
    Watch {
        /// Seconds between refreshes.
        #[arg(long)]
        interval: Option<u64>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Render an action template and execute it.
    Action {
        /// Template id (see `efdbui templates`).
        template: String,
        /// Template argument as key=value.
        #[arg(long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
        /// Execute without asking for confirmation.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Print the command an action template would run.
    Render {
        template: String,
        #[arg(long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
    },
    /// List the action templates.
    Templates,
    /// Fetch, then count matches of a query in each output.
    Search {
        query: String,
        /// Operations to search; all when omitted.
        ops: Vec<String>,
    },
}

#[derive(Debug, Clone, clap::Args)]
struct FilterArgs {
    /// Hide DELETE_INSTANCE background tasks.
    #[arg(long)]
    exclude_background: bool,
    /// Comma-separated task types to hide.
    #[arg(long)]
    exclude_types: Option<String>,
}

impl FilterArgs {
    fn merge(&self, configured: &TaskFilter) -> TaskFilter {
        TaskFilter::new(
            self.exclude_background || configured.exclude_background,
            self.exclude_types
                .clone()
                .unwrap_or_else(|| configured.custom.clone()),
        )
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got '{raw}'"))?;
    Ok((key.trim().to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let settings = load_settings(&cli)?;
    debug!(?settings, "resolved settings");

    match &cli.command {
        Commands::Fetch {
            ops,
            sequential,
            filter,
        } => {
            let policy = if *sequential {
                match settings.policy {
                    FetchPolicy::Sequential { delay } => FetchPolicy::Sequential { delay },
                    FetchPolicy::Concurrent => FetchPolicy::Sequential {
                        delay: Duration::ZERO,
                    },
                }
            } else {
                settings.policy
            };
            let orchestrator = build_orchestrator(&settings, policy, filter.merge(&settings.task_filter));
            run_fetch_command(&orchestrator, ops).await
        }
        Commands::Watch { interval, filter } => {
            let orchestrator = build_orchestrator(
                &settings,
                settings.policy,
                filter.merge(&settings.task_filter),
            );
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(settings.refresh_interval);
            run_watch(&orchestrator, interval).await
        }
        Commands::Action {
            template,
            args,
            yes,
        } => {
            let orchestrator =
                build_orchestrator(&settings, settings.policy, settings.task_filter.clone());
            run_action(&orchestrator, template, args, *yes).await
        }
        Commands::Render { template, args } => {
            let orchestrator =
                build_orchestrator(&settings, settings.policy, settings.task_filter.clone());
            let command = orchestrator.render_action(template, &to_map(args))?;
            println!("{command}");
            Ok(())
        }
        Commands::Templates => {
            let orchestrator =
                build_orchestrator(&settings, settings.policy, settings.task_filter.clone());
            print_templates(&orchestrator);
            Ok(())
        }
        Commands::Search { query, ops } => {
            let orchestrator =
                build_orchestrator(&settings, settings.policy, settings.task_filter.clone());
            run_selected(&orchestrator, ops).await?;
            let results = orchestrator.search(query);
            for (op, count) in &results.matches {
                if ops.is_empty() || ops.contains(op) {
                    println!("{op:<8} {count}");
                }
            }
            println!("{:<8} {}", "total", results.total());
            Ok(())
        }
    }
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(io::stderr)
        .try_init();

    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let config_path = if cli.no_config {
        None
    } else {
        cli.config.clone().or_else(default_config_path)
    };
    let config = match config_path {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    let mut settings = Settings::from_config(&config)?;
    if let Some(cluster) = &cli.cluster {
        settings.cluster = cluster.clone();
    }
    if let Some(deployment) = &cli.deployment {
        settings.deployment = deployment.clone();
    }
    if cli.no_history {
        settings.history_log = None;
    }
    Ok(settings)
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(CONFIG_FILE_NAME);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn build_orchestrator(settings: &Settings, policy: FetchPolicy, task_filter: TaskFilter) -> FetchOrchestrator {
    let runner = ProcessRunner::new(settings.runner_config());
    FetchOrchestrator::new(
        runner,
        OrchestratorConfig {
            target: ClusterTarget::new(settings.cluster.clone(), settings.deployment.clone()),
            binaries: settings.binaries.clone(),
            fetches: settings.fetches(),
            policy,
            events_window: settings.events_window,
            action_timeout: settings.action_timeout,
            task_filter,
            history: settings
                .history_log
                .clone()
                .map(|path| Arc::new(HistoryLog::new(path))),
        },
    )
}

// Runs the named operations one after another, or everything under the
// configured policy when none are named.
async fn run_selected(orchestrator: &FetchOrchestrator, ops: &[String]) -> Result<()> {
    let known = orchestrator.fetch_names();
    if let Some(unknown) = ops.iter().find(|op| !known.contains(op)) {
        bail!("unknown fetch operation '{unknown}' (expected one of: {})", known.join(", "));
    }
    if ops.is_empty() {
        orchestrator.run_all().await;
    } else {
        for op in ops {
            orchestrator.run_fetch(op).await;
        }
    }
    Ok(())
}

async fn run_fetch_command(orchestrator: &FetchOrchestrator, ops: &[String]) -> Result<()> {
    run_selected(orchestrator, ops).await?;

    let mut failed = 0;
    for (op, state) in orchestrator.states() {
        if !ops.is_empty() && !ops.contains(&op) {
            continue;
        }
        if state.status == FetchStatus::Failed {
            failed += 1;
        }
        print_state(&op, &state);
    }
    if failed > 0 {
        bail!("{failed} fetch operation(s) failed");
    }
    Ok(())
}

async fn run_watch(orchestrator: &FetchOrchestrator, interval: Duration) -> Result<()> {
    let mut events = orchestrator.subscribe();
    orchestrator.enable_auto_refresh(interval);
    info!(interval_secs = interval.as_secs(), "watching");

    let initial = orchestrator.clone();
    tokio::spawn(async move { initial.run_all().await });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(FetchEvent::FetchFinished { op, .. }) => {
                    if let Some(state) = orchestrator.state(&op) {
                        print_state(&op, &state);
                    }
                }
                Some(FetchEvent::RefreshTick) => {
                    eprintln!("-- refreshing at {} --", Local::now().format("%H:%M:%S"));
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    orchestrator.disable_auto_refresh();
    Ok(())
}

async fn run_action(
    orchestrator: &FetchOrchestrator,
    template_id: &str,
    args: &[(String, String)],
    yes: bool,
) -> Result<()> {
    let templates = orchestrator.templates();
    let template = templates
        .get(template_id)
        .ok_or_else(|| anyhow!("unknown command template '{template_id}'"))?;
    let command = template.try_render(&to_map(args))?;
    if !template.is_implemented {
        eprintln!("warning: '{}' is not fully supported yet", template.name);
    }
    if !yes && !confirm(&template.confirmation_prompt(&command))? {
        eprintln!("Cancelled.");
        return Ok(());
    }
    let output = orchestrator.execute_action(&command).await?;
    print!("{output}");
    if !output.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_templates(orchestrator: &FetchOrchestrator) {
    for template in orchestrator.templates().iter() {
        let mut flags = Vec::new();
        if template.is_destructive {
            flags.push("destructive");
        }
        if !template.is_implemented {
            flags.push("unsupported");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!("{:<22} {}{flags}", template.id, template.description);
        for arg in &template.arguments {
            let required = if arg.is_required { "required" } else { "optional" };
            println!("    --arg {}=<{}>  ({required})", arg.key, arg.placeholder);
        }
    }
}

fn print_state(op: &str, state: &FetchState) {
    let updated = state
        .last_updated
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!("=== {op} ({}, updated {updated}) ===", state.status.label());
    println!("{}", state.last_output);
    println!();
}

fn to_map(args: &[(String, String)]) -> HashMap<String, String> {
    args.iter().cloned().collect()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_action_arguments() {
        let cli = Cli::try_parse_from([
            "efdbui",
            "--cluster",
            "c1",
            "action",
            "abort-task",
            "--arg",
            "task_id=t-1",
            "--arg",
            "reason=stuck for hours",
            "--yes",
        ])
        .unwrap();
        assert_eq!(cli.cluster.as_deref(), Some("c1"));
        match cli.command {
            Commands::Action { template, args, yes } => {
                assert_eq!(template, "abort-task");
                assert!(yes);
                let map = to_map(&args);
                assert_eq!(map["task_id"], "t-1");
                assert_eq!(map["reason"], "stuck for hours");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_key_value() {
        assert!(parse_key_val("noequals").is_err());
        assert_eq!(
            parse_key_val("k=a=b").unwrap(),
            ("k".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn filter_flags_override_config() {
        let args = FilterArgs {
            exclude_background: false,
            exclude_types: Some("BACKUP".into()),
        };
        let merged = args.merge(&TaskFilter::new(true, "RESIZE"));
        assert_eq!(merged, TaskFilter::new(true, "BACKUP"));
    }
}
