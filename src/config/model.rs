// src/config/model.rs

use serde::Deserialize;

use crate::types::LogLevelSetting;

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [scheduler]
/// period_ms = 20
/// stack_size_kib = 256
/// thread_name_prefix = "cmd"
/// stop_on_error = false
///
/// [logging]
/// level = "info"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

/// Validated configuration. Only obtainable through
/// `ConfigFile::try_from(RawConfigFile)` or [`ConfigFile::default`].
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub logging: LoggingSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(scheduler: SchedulerSection, logging: LoggingSection) -> Self {
        Self { scheduler, logging }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    /// Tick period of the tick loop, in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Stack size of each execution-context thread, in KiB.
    #[serde(default = "default_stack_size_kib")]
    pub stack_size_kib: usize,

    /// Execution-context threads are named `{prefix}-{run id}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Stop the tick loop on the first tick that aborts with an error.
    #[serde(default)]
    pub stop_on_error: bool,
}

fn default_period_ms() -> u64 {
    20
}

fn default_stack_size_kib() -> usize {
    256
}

fn default_thread_name_prefix() -> String {
    "cmd".to_string()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            stack_size_kib: default_stack_size_kib(),
            thread_name_prefix: default_thread_name_prefix(),
            stop_on_error: false,
        }
    }
}

/// `[logging]` section.
///
/// The level here is the lowest-precedence source; `--log-level` and
/// `CMDLOOP_LOG` both override it.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<LogLevelSetting>,
}
