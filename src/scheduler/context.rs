// src/scheduler/context.rs

//! Scheduler-internal bookkeeping records.

use std::panic::{self, AssertUnwindSafe};

use tracing::{error, trace};

use crate::command::{Body, Command, Hook};
use crate::coroutine::{Fiber, panic_message};

/// Identifier of one execution of one command.
pub(crate) type RunId = u64;

/// A mounted command: one execution of a command plus the link to the
/// context that created it.
pub(crate) struct Context {
    pub(crate) run_id: RunId,
    pub(crate) command: Command,
    pub(crate) parent: Option<RunId>,
    /// Spawned lazily on the first step; `None` while the step is running.
    pub(crate) fiber: Option<Fiber>,
    /// Set by a composition giving up; the normal return is then reported as
    /// a cancellation.
    pub(crate) abandoned: bool,
    pub(crate) last_runtime_us: Option<u64>,
    pub(crate) total_runtime_us: u64,
}

impl Context {
    pub(crate) fn new(run_id: RunId, command: Command, parent: Option<RunId>) -> Self {
        Self {
            run_id,
            command,
            parent,
            fiber: None,
            abandoned: false,
            last_runtime_us: None,
            total_runtime_us: 0,
        }
    }

    pub(crate) fn record_step(&mut self, micros: u64) {
        self.last_runtime_us = Some(micros);
        self.total_runtime_us = self.total_runtime_us.saturating_add(micros);
    }
}

/// A top-level schedule request waiting for the next promotion.
#[derive(Clone)]
pub(crate) struct Request {
    pub(crate) command: Command,
    /// Context the command will be mounted under (trigger binding scopes).
    pub(crate) parent: Option<RunId>,
}

/// A coroutine body run once per tick outside the command structure.
pub(crate) struct Sideload {
    pub(crate) id: u64,
    pub(crate) body: Body,
    pub(crate) fiber: Option<Fiber>,
}

/// Work that must happen after the state lock is released.
///
/// Cancellation hooks are user code, and dropping a fiber joins its thread
/// while the body unwinds; neither may run under the lock.
#[derive(Default)]
pub(crate) struct Teardown {
    pub(crate) hooks: Vec<(Command, Hook)>,
    pub(crate) contexts: Vec<Context>,
    pub(crate) fibers: Vec<Fiber>,
}

impl Teardown {
    /// A panicking hook is logged and the remaining hooks still run.
    pub(crate) fn apply(self) {
        for (command, hook) in self.hooks {
            trace!(command = %command, "running cancellation hook");
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook())) {
                error!(
                    command = %command,
                    panic = %panic_message(payload.as_ref()),
                    "cancellation hook panicked"
                );
            }
        }
        // Drop order: contexts (and their fibers) after hooks.
        drop(self.contexts);
        drop(self.fibers);
    }
}

