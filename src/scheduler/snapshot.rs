// src/scheduler/snapshot.rs

//! Serializable point-in-time view of the scheduler.

use serde::Serialize;

use crate::command::Command;

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub tick: u64,
    pub last_tick_runtime_us: u64,
    pub queued: Vec<CommandSnapshot>,
    pub running: Vec<CommandSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandSnapshot {
    pub name: String,
    pub priority: i32,
    pub requirements: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_runtime_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_runtime_us: Option<u64>,
}

impl CommandSnapshot {
    pub(crate) fn of(command: &Command) -> Self {
        Self {
            name: command.name().to_string(),
            priority: command.priority(),
            requirements: command
                .requirements()
                .iter()
                .map(|m| m.name().to_string())
                .collect(),
            run_id: None,
            parent: None,
            last_runtime_us: None,
            total_runtime_us: None,
        }
    }
}

impl SchedulerSnapshot {
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty()
    }

    /// Names of running commands in mount order.
    pub fn running_names(&self) -> Vec<&str> {
        self.running.iter().map(|c| c.name.as_str()).collect()
    }
}
