// src/config/validate.rs

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{CmdloopError, Result};

/// Smallest execution-context stack accepted, in KiB.
pub const MIN_STACK_SIZE_KIB: usize = 64;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = CmdloopError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.scheduler, raw.logging))
    }
}

/// Run every check on an unvalidated config.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    validate_raw_config(cfg)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_period(cfg)?;
    validate_stack_size(cfg)?;
    validate_thread_name_prefix(cfg)?;
    Ok(())
}

fn validate_period(cfg: &RawConfigFile) -> Result<()> {
    if cfg.scheduler.period_ms == 0 {
        return Err(CmdloopError::ConfigError(
            "[scheduler].period_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_stack_size(cfg: &RawConfigFile) -> Result<()> {
    let kib = cfg.scheduler.stack_size_kib;
    if kib < MIN_STACK_SIZE_KIB {
        return Err(CmdloopError::ConfigError(format!(
            "[scheduler].stack_size_kib must be >= {MIN_STACK_SIZE_KIB} (got {kib})"
        )));
    }
    if kib.checked_mul(1024).is_none() {
        return Err(CmdloopError::ConfigError(format!(
            "[scheduler].stack_size_kib is too large (got {kib})"
        )));
    }
    Ok(())
}

fn validate_thread_name_prefix(cfg: &RawConfigFile) -> Result<()> {
    let prefix = &cfg.scheduler.thread_name_prefix;
    if prefix.trim().is_empty() {
        return Err(CmdloopError::ConfigError(
            "[scheduler].thread_name_prefix must not be empty".to_string(),
        ));
    }
    if prefix.contains('\0') {
        return Err(CmdloopError::ConfigError(
            "[scheduler].thread_name_prefix must not contain NUL bytes".to_string(),
        ));
    }
    Ok(())
}
