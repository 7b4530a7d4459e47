// src/lib.rs

pub mod cli;
pub mod clock;
pub mod command;
pub mod config;
pub mod coroutine;
pub mod demo;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod scheduler;
pub mod trigger;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::clock::MonotonicClock;
use crate::config::loader::{default_config_path, load_and_validate, load_or_default};
use crate::config::model::ConfigFile;
use crate::demo::Robot;
use crate::engine::TickLoop;

pub use crate::clock::{Clock, ManualClock};
pub use crate::command::{Command, Mechanism, State, StateMachine};
pub use crate::coroutine::Coroutine;
pub use crate::errors::CmdloopError;
pub use crate::scheduler::{EventKind, Scheduler, SchedulerEvent, SchedulerOptions};
pub use crate::trigger::Trigger;
pub use crate::types::{DebounceKind, ScheduleResult};

/// Load the config named on the command line.
///
/// The default path may be absent, in which case built-in defaults apply; an
/// explicitly given path must exist.
pub fn load_config(args: &CliArgs) -> Result<ConfigFile> {
    let path = Path::new(&args.config);
    let cfg = if path == default_config_path() {
        load_or_default(path)
    } else {
        load_and_validate(path)
    };
    cfg.with_context(|| format!("loading config from {}", path.display()))
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - the scheduler, built from `[scheduler]`
/// - the demo robot (mechanisms, defaults, sensor, trigger bindings)
/// - the tick loop
/// - Ctrl-C handling
pub async fn run(args: CliArgs, cfg: ConfigFile) -> Result<()> {
    let scheduler = Scheduler::from_config(&cfg, Arc::new(MonotonicClock::new()));
    let robot = Robot::install(&scheduler)?;

    if args.dry_run {
        print_dry_run(&cfg, &robot);
        return Ok(());
    }

    scheduler.add_event_listener(|event| debug!(%event, "lifecycle"));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let report = TickLoop::from_config(scheduler.clone(), &cfg)
        .max_ticks(args.ticks)
        .run(shutdown)
        .await?;

    let snapshot = scheduler.snapshot();
    scheduler.cancel_all()?;

    info!(
        ticks = report.ticks,
        failures = report.failures,
        scored = robot.snapshot().pieces_scored,
        "simulation finished"
    );
    println!("{}", toml::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Simple dry-run output: print config and the robot's commands.
fn print_dry_run(cfg: &ConfigFile, robot: &Robot) {
    println!("cmdloop dry-run");
    println!("  scheduler.period_ms = {}", cfg.scheduler.period_ms);
    println!("  scheduler.stack_size_kib = {}", cfg.scheduler.stack_size_kib);
    println!(
        "  scheduler.thread_name_prefix = {:?}",
        cfg.scheduler.thread_name_prefix
    );
    println!("  scheduler.stop_on_error = {}", cfg.scheduler.stop_on_error);
    println!();

    println!("mechanisms:");
    for mechanism in [&robot.elevator, &robot.intake] {
        println!("  - {mechanism}");
    }
    println!();

    println!("commands:");
    for command in [&robot.intake_piece, &robot.score] {
        println!("  - {command} (priority {})", command.priority());
        let requirements: Vec<&str> = command.requirements().iter().map(|m| m.name()).collect();
        println!("      requires: {requirements:?}");
        for child in command.children() {
            println!("      step: {child}");
        }
    }

    debug!("dry-run complete (no ticks)");
}
