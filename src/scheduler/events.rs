// src/scheduler/events.rs

//! Lifecycle events published by the scheduler.
//!
//! Events are collected while the scheduler's state is locked and delivered
//! to listeners afterwards, in emission order. Listeners are for observation
//! (logging, telemetry, tests); they must not drive control decisions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;

#[derive(Debug, Clone)]
pub enum EventKind {
    /// A schedule request was accepted (queued, or about to mount inline).
    Scheduled,
    /// The command received an execution context.
    Mounted,
    /// The body suspended and will be resumed on a later tick.
    Yielded,
    /// The body returned normally.
    Completed,
    /// The body returned an error or panicked.
    Failed { error: String },
    /// The command was canceled explicitly, by its parent ending, or by a
    /// parallel group giving up.
    Canceled,
    /// The command was preempted by a conflicting command.
    Interrupted { by: Command },
}

impl EventKind {
    /// Short lowercase label, handy for log fields and assertions.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Scheduled => "scheduled",
            EventKind::Mounted => "mounted",
            EventKind::Yielded => "yielded",
            EventKind::Completed => "completed",
            EventKind::Failed { .. } => "failed",
            EventKind::Canceled => "canceled",
            EventKind::Interrupted { .. } => "interrupted",
        }
    }

    /// True for every kind that ends an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Completed
                | EventKind::Failed { .. }
                | EventKind::Canceled
                | EventKind::Interrupted { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerEvent {
    pub kind: EventKind,
    pub command: Command,
    /// Tick counter at emission; events emitted before the first tick carry 0.
    pub tick: u64,
    /// Scheduler clock at emission.
    pub timestamp: Duration,
}

impl fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[tick {}] {} {}", self.tick, self.command.name(), self.kind.label())?;
        match &self.kind {
            EventKind::Failed { error } => write!(f, ": {error}"),
            EventKind::Interrupted { by } => write!(f, " by {}", by.name()),
            _ => Ok(()),
        }
    }
}

pub(crate) type Listener = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;
