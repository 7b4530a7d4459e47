// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of asking the scheduler to run a command.
///
/// Only `Success` means the command was queued or mounted. The other two are
/// normal arbitration results, not errors: anything awaiting a rejected
/// command treats it as already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleResult {
    /// The command was accepted (queued for the next tick, or mounted inline
    /// when scheduled from a running body).
    Success,
    /// The very same command object is already queued or running.
    AlreadyRunning,
    /// A conflicting command with a strictly higher priority holds one of the
    /// requested mechanisms.
    LowerPriorityThanRunningCommand,
}

impl ScheduleResult {
    pub fn is_success(self) -> bool {
        matches!(self, ScheduleResult::Success)
    }
}

impl fmt::Display for ScheduleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleResult::Success => "success",
            ScheduleResult::AlreadyRunning => "already running",
            ScheduleResult::LowerPriorityThanRunningCommand => {
                "lower priority than running command"
            }
        };
        f.write_str(s)
    }
}

/// Which signal transitions a debounced trigger delays.
///
/// - `Rising`: false -> true must hold for the full debounce time.
/// - `Falling`: true -> false must hold for the full debounce time.
/// - `Both`: any change must hold for the full debounce time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebounceKind {
    #[default]
    Rising,
    Falling,
    Both,
}

impl FromStr for DebounceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rising" => Ok(DebounceKind::Rising),
            "falling" => Ok(DebounceKind::Falling),
            "both" => Ok(DebounceKind::Both),
            other => Err(format!(
                "invalid debounce kind: {other} (expected \"rising\", \"falling\" or \"both\")"
            )),
        }
    }
}

/// Log verbosity accepted in `[logging] level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevelSetting {
    Error,
    #[serde(alias = "warning")]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelSetting> for tracing::Level {
    fn from(value: LogLevelSetting) -> Self {
        match value {
            LogLevelSetting::Error => tracing::Level::ERROR,
            LogLevelSetting::Warn => tracing::Level::WARN,
            LogLevelSetting::Info => tracing::Level::INFO,
            LogLevelSetting::Debug => tracing::Level::DEBUG,
            LogLevelSetting::Trace => tracing::Level::TRACE,
        }
    }
}
