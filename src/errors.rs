// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Resource conflicts and priority rejections are *not* errors: they surface
//! as lifecycle events and [`ScheduleResult`](crate::types::ScheduleResult)
//! values. Everything here is either caller misuse, a failing command body, or
//! a problem in the ambient layers (config, IO).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmdloopError {
    /// Two commands that were asked to run side by side need the same mechanism.
    #[error(
        "Commands running in parallel cannot share requirements: \
         {first} and {second} both require {mechanism}"
    )]
    ConflictingRequirements {
        first: String,
        second: String,
        mechanism: String,
    },

    #[error("Command `{command}` is mounted and cannot be canceled")]
    CancelWhileMounted { command: String },

    #[error("Invalid default command for mechanism `{mechanism}`: {reason}")]
    InvalidDefaultCommand { mechanism: String, reason: String },

    #[error("State machine `{machine}` is invalid: {reason}")]
    InvalidStateMachine { machine: String, reason: String },

    #[error("Scheduler::tick() cannot be called while the scheduler is running commands")]
    ReentrantTick,

    #[error("Command `{command}` failed: {error:#}")]
    CommandFailed {
        command: String,
        error: anyhow::Error,
    },

    #[error("Sideload failed: {error:#}")]
    SideloadFailed { error: anyhow::Error },

    #[error("Failed to spawn execution context: {0}")]
    ContextSpawn(std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CmdloopError {
    /// Name of the command whose body failed, if this is a body failure.
    pub fn failed_command(&self) -> Option<&str> {
        match self {
            CmdloopError::CommandFailed { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Walk nested [`CmdloopError::CommandFailed`] wrappers down to the error
    /// the innermost body actually produced.
    pub fn root_failure(&self) -> Option<&anyhow::Error> {
        let mut current = match self {
            CmdloopError::CommandFailed { error, .. } | CmdloopError::SideloadFailed { error } => {
                error
            }
            _ => return None,
        };
        while let Some(CmdloopError::CommandFailed { error, .. }) =
            current.downcast_ref::<CmdloopError>()
        {
            current = error;
        }
        Some(current)
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CmdloopError>;
