// src/engine/tick_loop.rs

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::model::ConfigFile;
use crate::errors::{CmdloopError, Result};
use crate::scheduler::Scheduler;

/// Why [`TickLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Shutdown,
    TickBudget,
    Error,
}

/// Summary of one [`TickLoop::run`].
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub ticks: u64,
    /// Ticks that ended with an error.
    pub failures: u64,
    pub stopped_by: StopReason,
    /// Rendered error of the most recent aborted tick.
    pub last_error: Option<String>,
}

/// Fixed-period async driver around [`Scheduler::tick`].
///
/// Each tick runs on the blocking pool, since resuming command bodies blocks
/// the calling thread until they suspend.
pub struct TickLoop {
    scheduler: Scheduler,
    period: Duration,
    max_ticks: Option<u64>,
    stop_on_error: bool,
}

impl fmt::Debug for TickLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickLoop")
            .field("period", &self.period)
            .field("max_ticks", &self.max_ticks)
            .field("stop_on_error", &self.stop_on_error)
            .finish_non_exhaustive()
    }
}

impl TickLoop {
    pub fn new(scheduler: Scheduler, period: Duration) -> Self {
        Self {
            scheduler,
            period,
            max_ticks: None,
            stop_on_error: false,
        }
    }

    pub fn from_config(scheduler: Scheduler, cfg: &ConfigFile) -> Self {
        Self::new(scheduler, Duration::from_millis(cfg.scheduler.period_ms))
            .stop_on_error(cfg.scheduler.stop_on_error)
    }

    /// Stop after this many ticks. `None` runs until shutdown.
    pub fn max_ticks(mut self, max_ticks: Option<u64>) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Tick until `shutdown` resolves, the tick budget is spent, or (with
    /// `stop_on_error`) a tick aborts.
    pub async fn run<F>(self, shutdown: F) -> Result<TickReport>
    where
        F: Future<Output = ()>,
    {
        info!(period = ?self.period, max_ticks = ?self.max_ticks, "tick loop started");

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut report = TickReport::default();
        loop {
            if self.max_ticks.is_some_and(|max| report.ticks >= max) {
                report.stopped_by = StopReason::TickBudget;
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping tick loop");
                    report.stopped_by = StopReason::Shutdown;
                    break;
                }
                _ = interval.tick() => {}
            }

            let scheduler = self.scheduler.clone();
            let outcome = tokio::task::spawn_blocking(move || scheduler.tick())
                .await
                .map_err(|e| CmdloopError::Other(anyhow!("tick task failed: {e}")))?;
            report.ticks += 1;

            if let Err(err) = outcome {
                report.failures += 1;
                error!(tick = report.ticks, error = %err, "tick aborted");
                report.last_error = Some(err.to_string());
                if self.stop_on_error {
                    report.stopped_by = StopReason::Error;
                    break;
                }
            } else {
                debug!(
                    tick = report.ticks,
                    runtime = ?self.scheduler.last_tick_runtime(),
                    "tick finished"
                );
            }
        }

        info!(
            ticks = report.ticks,
            failures = report.failures,
            stopped_by = ?report.stopped_by,
            "tick loop stopped"
        );
        Ok(report)
    }
}
