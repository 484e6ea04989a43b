//! Event definitions for orchestrator observers.
//!
//! This module defines the `FetchEvent` enum which a caller can subscribe to
//! instead of polling fetch state. Events carry names and outcomes only; the
//! full state is read back through the orchestrator.

use crate::process::FetchStatus;

/// Notification published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// A named fetch entered the loading state.
    FetchStarted { op: String },
    /// A named fetch reached a terminal state.
    FetchFinished { op: String, status: FetchStatus },
    /// An ad hoc action completed, successfully or not.
    ActionFinished { command: String, success: bool },
    /// The auto-refresh timer fired and a full refresh is starting.
    RefreshTick,
}
