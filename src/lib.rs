//! efdbui: runs `efdb` and `sanssh` cluster commands through the operator's
//! login shell, with bounded timeouts, post-processed output and an
//! append-only command history.

pub mod action;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod history;
pub mod orchestrator;
pub mod output;
pub mod process;
pub mod runner;
pub mod templates;

pub use action::ActionExecutor;
pub use error::CommandError;
pub use events::FetchEvent;
pub use fetch::FetchSpec;
pub use history::{HistoryEntry, HistoryLog};
pub use orchestrator::{FetchOrchestrator, FetchPolicy, OrchestratorConfig, SearchResults};
pub use output::TaskFilter;
pub use process::{ClusterTarget, ExecutionRequest, ExecutionResult, FetchState, FetchStatus};
pub use runner::{ProcessRunner, RunnerConfig, ShellConfig};
pub use templates::{Binaries, CommandTemplate, TemplateRegistry};
