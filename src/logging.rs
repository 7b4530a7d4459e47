// src/logging.rs

//! Logging setup for `cmdloop` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `CMDLOOP_LOG` environment variable (e.g. "info", "debug")
//! 3. `[logging] level` from the config file
//! 4. default to `info`
//!
//! Logs are sent to STDERR so that stdout stays free for the final
//! scheduler snapshot.

use anyhow::Result;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;
use crate::types::LogLevelSetting;

/// Name of the environment variable consulted for the log level.
pub const LOG_ENV_VAR: &str = "CMDLOOP_LOG";

/// Initialise global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, config_level: Option<LogLevelSetting>) -> Result<()> {
    let env_level = std::env::var(LOG_ENV_VAR).ok();
    let level = resolve_level(cli_level, env_level.as_deref(), config_level);

    // Thread names identify the execution context a body log came from.
    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}

/// Apply the precedence rules above. Unparseable env values are ignored.
pub fn resolve_level(
    cli_level: Option<LogLevel>,
    env_level: Option<&str>,
    config_level: Option<LogLevelSetting>,
) -> tracing::Level {
    if let Some(lvl) = cli_level {
        return level_from_log_level(lvl);
    }
    if let Some(lvl) = env_level.and_then(parse_level_str) {
        return lvl;
    }
    config_level
        .map(tracing::Level::from)
        .unwrap_or(tracing::Level::INFO)
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn cli_beats_env_beats_config() {
        assert_eq!(
            resolve_level(Some(LogLevel::Trace), Some("warn"), Some(LogLevelSetting::Error)),
            Level::TRACE
        );
        assert_eq!(
            resolve_level(None, Some("warn"), Some(LogLevelSetting::Error)),
            Level::WARN
        );
        assert_eq!(
            resolve_level(None, None, Some(LogLevelSetting::Error)),
            Level::ERROR
        );
        assert_eq!(resolve_level(None, None, None), Level::INFO);
    }

    #[test]
    fn garbage_env_value_falls_through() {
        assert_eq!(
            resolve_level(None, Some("loud"), Some(LogLevelSetting::Debug)),
            Level::DEBUG
        );
    }
}
