// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `cmdloop`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cmdloop",
    version,
    about = "Drive a simulated robot with the cooperative command scheduler.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Cmdloop.toml` in the current working directory. A missing
    /// file at the default path means built-in defaults.
    #[arg(long, value_name = "PATH", default_value = "Cmdloop.toml")]
    pub config: String,

    /// Stop after this many ticks instead of running until Ctrl-C.
    #[arg(long, value_name = "N")]
    pub ticks: Option<u64>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CMDLOOP_LOG`, then `[logging] level`, then `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate the config and print the robot's commands, but do not
    /// tick the scheduler.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
