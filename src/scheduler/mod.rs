// src/scheduler/mod.rs

//! The command scheduler.
//!
//! A [`Scheduler`] owns:
//! - the mount table (every live execution context, in mount order)
//! - the queue of top-level schedule requests waiting for the next tick
//! - default commands, sideloads and registered triggers
//! - the event listeners
//!
//! One call to [`Scheduler::tick`] does, in order:
//! 1. poll every trigger
//! 2. step every sideload
//! 3. promote queued requests, preempting conflicting mounted trees
//! 4. resume every mounted context once; a child always runs before the
//!    parent that awaits it, and unrelated trees run in mount order
//! 5. queue default commands for unclaimed mechanisms
//! 6. deliver lifecycle events
//!
//! Only one body runs at any instant. The state lock is never held while a
//! body, a cancellation hook or a listener runs; that is what lets bodies
//! call back into the scheduler freely. A panicking hook or listener is
//! logged and skipped.

mod context;
mod events;
mod snapshot;
mod state;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::clock::{MonotonicClock, SharedClock};
use crate::command::{Command, Mechanism};
use crate::config::model::ConfigFile;
use crate::coroutine::{Coroutine, Fiber, Step, panic_message};
use crate::errors::{CmdloopError, Result};
use crate::trigger::TriggerCore;
use crate::types::ScheduleResult;

pub(crate) use context::RunId;
use context::{Sideload, Teardown};
pub use events::{EventKind, SchedulerEvent};
use events::Listener;
pub use snapshot::{CommandSnapshot, SchedulerSnapshot};
use state::{Admission, State};

/// Default stack size of an execution-context thread.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Knobs for how execution contexts are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Stack size, in bytes, of each execution-context thread.
    pub stack_size: usize,
    /// Prefix for execution-context thread names (`{prefix}-{run id}`).
    pub thread_name_prefix: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: "cmd".to_string(),
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    listeners: RwLock<Vec<Listener>>,
    clock: SharedClock,
    options: SchedulerOptions,
}

/// Handle to a scheduler. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// A scheduler on the monotonic system clock with default options.
    pub fn new() -> Self {
        Self::with_options(SchedulerOptions::default(), Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self::with_options(SchedulerOptions::default(), clock)
    }

    pub fn with_options(options: SchedulerOptions, clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new(clock.clone())),
                listeners: RwLock::new(Vec::new()),
                clock,
                options,
            }),
        }
    }

    pub fn from_config(cfg: &ConfigFile, clock: SharedClock) -> Self {
        Self::with_options(
            SchedulerOptions {
                stack_size: cfg.scheduler.stack_size_kib * 1024,
                thread_name_prefix: cfg.scheduler.thread_name_prefix.clone(),
            },
            clock,
        )
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub fn clock(&self) -> SharedClock {
        self.shared.clock.clone()
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.shared.options
    }

    // ----- scheduling ---------------------------------------------------

    /// Ask for `command` to run.
    ///
    /// Outside a running body the command is queued and mounted on the next
    /// tick. From inside a running body it is a fork: the command becomes a
    /// child of that body and runs up to its first suspension before this
    /// returns. An error from that first step is returned here.
    pub fn schedule(&self, command: &Command) -> Result<ScheduleResult> {
        self.schedule_scoped(command, None)
    }

    pub(crate) fn schedule_scoped(
        &self,
        command: &Command,
        scope: Option<RunId>,
    ) -> Result<ScheduleResult> {
        let mut teardown = Teardown::default();
        let admission = self.shared.state.lock().admit(command, scope, &mut teardown);
        self.settle(teardown);

        match admission {
            Admission::Rejected(result) => Ok(result),
            Admission::Queued => Ok(ScheduleResult::Success),
            Admission::Mounted(run_id) => {
                self.run_context(run_id)?;
                Ok(ScheduleResult::Success)
            }
        }
    }

    /// Cancel `command` if it is queued or running.
    ///
    /// Its cancellation hook runs only if it was running. A body may not
    /// cancel itself or anything it is being resumed by.
    pub fn cancel(&self, command: &Command) -> Result<()> {
        let mut teardown = Teardown::default();
        let result = self.shared.state.lock().cancel(command, &mut teardown);
        self.settle(teardown);
        result
    }

    /// Cancel every queued and running command. Not callable from a body.
    pub fn cancel_all(&self) -> Result<()> {
        let mut teardown = Teardown::default();
        let result = self.shared.state.lock().cancel_all(&mut teardown);
        self.settle(teardown);
        result
    }

    /// Register `command` as the fallback for `mechanism`.
    ///
    /// It must require `mechanism` and nothing else. The command is queued
    /// right away like any top-level request, so it replaces a previous
    /// default of equal or lower priority on the next tick. It is queued
    /// again whenever the mechanism becomes idle.
    pub fn set_default_command(&self, mechanism: &Mechanism, command: Command) -> Result<()> {
        let reason = if !command.requires(mechanism) {
            Some("the command does not require the mechanism")
        } else if command.requirements().len() > 1 {
            Some("the command requires other mechanisms as well")
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(mechanism = %mechanism, command = %command, reason, "rejected default command");
            return Err(CmdloopError::InvalidDefaultCommand {
                mechanism: mechanism.name().to_string(),
                reason: reason.to_string(),
            });
        }

        let admission = {
            let mut state = self.shared.state.lock();
            state.set_default(mechanism, command.clone());
            state.admit_default(&command)
        };
        debug!(mechanism = %mechanism, command = %command, ?admission, "default command registered");
        self.flush_events();
        Ok(())
    }

    pub fn default_command_for(&self, mechanism: &Mechanism) -> Option<Command> {
        self.shared.state.lock().default_for(mechanism)
    }

    /// Run `body` as a coroutine once per tick, before queued commands are
    /// promoted, until it returns.
    ///
    /// Commands it schedules are queued as top-level commands and promoted in
    /// the same tick.
    pub fn sideload<F>(&self, body: F)
    where
        F: Fn(&Coroutine) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = state.next_sideload_id();
        state.sideloads.push(Sideload {
            id,
            body: Arc::new(body),
            fiber: None,
        });
    }

    /// Run `callback` at the start of every tick, forever.
    pub fn add_periodic<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.sideload(move |co: &Coroutine| -> anyhow::Result<()> {
            loop {
                callback();
                co.yield_now();
            }
        });
    }

    pub fn add_event_listener<F>(&self, listener: F)
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    pub(crate) fn register_trigger(&self, trigger: Arc<TriggerCore>) {
        self.shared.state.lock().triggers.push(trigger);
    }

    pub(crate) fn abandon(&self, command: &Command) {
        let mut state = self.shared.state.lock();
        let run_id = state.context_of(command).map(|c| c.run_id);
        if let Some(ctx) = run_id.and_then(|id| state.context_mut(id)) {
            ctx.abandoned = true;
        }
    }

    // ----- tick ---------------------------------------------------------

    /// Advance every mounted command by one step.
    ///
    /// Returns the first body failure of this tick, if any; the rest of the
    /// tick is skipped and the scheduler stays usable.
    pub fn tick(&self) -> Result<()> {
        let started = self.shared.clock.now_micros();
        {
            let mut state = self.shared.state.lock();
            if state.in_tick || !state.stack.is_empty() {
                return Err(CmdloopError::ReentrantTick);
            }
            state.in_tick = true;
            state.tick += 1;
        }

        let result = {
            let _guard = TickGuard {
                shared: &self.shared,
                started,
            };
            self.tick_inner()
        };
        self.flush_events();
        result
    }

    fn tick_inner(&self) -> Result<()> {
        self.poll_triggers()?;
        self.run_sideloads()?;

        let mut teardown = Teardown::default();
        self.shared.state.lock().promote(&mut teardown);
        self.settle(teardown);

        let order = self.shared.state.lock().resume_order();
        for run_id in order {
            self.run_context(run_id)?;
        }

        self.shared.state.lock().queue_defaults();
        Ok(())
    }

    fn poll_triggers(&self) -> Result<()> {
        let triggers = self.shared.state.lock().triggers.clone();
        for trigger in triggers {
            trigger.poll(self)?;
        }
        Ok(())
    }

    fn run_sideloads(&self) -> Result<()> {
        let ids: Vec<u64> = self.shared.state.lock().sideloads.iter().map(|s| s.id).collect();
        for id in ids {
            self.run_sideload(id)?;
        }
        Ok(())
    }

    fn run_sideload(&self, id: u64) -> Result<()> {
        let (mut fiber, body) = {
            let mut state = self.shared.state.lock();
            let Some(slot) = state.sideloads.iter_mut().find(|s| s.id == id) else {
                return Ok(());
            };
            (slot.fiber.take(), slot.body.clone())
        };
        if fiber.is_none() {
            let weak = self.downgrade();
            let clock = self.shared.clock.clone();
            fiber = Some(Fiber::spawn(
                format!("{}-sideload-{id}", self.shared.options.thread_name_prefix),
                self.shared.options.stack_size,
                move |suspender| body(&Coroutine::new(weak, clock, None, suspender)),
            )?);
        }
        let Some(mut fiber) = fiber else {
            return Ok(());
        };

        let step = fiber.resume();
        let mut state = self.shared.state.lock();
        match step {
            Step::Suspended => {
                if let Some(slot) = state.sideloads.iter_mut().find(|s| s.id == id) {
                    slot.fiber = Some(fiber);
                }
                Ok(())
            }
            Step::Finished(result) => {
                state.sideloads.retain(|s| s.id != id);
                drop(state);
                drop(fiber);
                result.map_err(|error| CmdloopError::SideloadFailed { error })
            }
        }
    }

    /// Resume one mounted context for one step.
    fn run_context(&self, run_id: RunId) -> Result<()> {
        let (fiber, command) = {
            let mut state = self.shared.state.lock();
            let Some(ctx) = state.context_mut(run_id) else {
                return Ok(());
            };
            let fiber = ctx.fiber.take();
            let command = ctx.command.clone();
            state.stack.push(run_id);
            (fiber, command)
        };

        let mut fiber = match fiber {
            Some(fiber) => fiber,
            None => match self.spawn_context(run_id, &command) {
                Ok(fiber) => fiber,
                Err(err) => {
                    let mut teardown = Teardown::default();
                    {
                        let mut state = self.shared.state.lock();
                        state.stack.pop();
                        state.fail(run_id, &anyhow::anyhow!("{err}"), &mut teardown);
                    }
                    self.settle(teardown);
                    return Err(err);
                }
            },
        };

        let started = self.shared.clock.now_micros();
        let step = fiber.resume();
        let elapsed = self.shared.clock.now_micros().saturating_sub(started);

        let mut teardown = Teardown::default();
        let outcome = {
            let mut state = self.shared.state.lock();
            state.stack.pop();
            match step {
                Step::Suspended => {
                    match state.context_mut(run_id) {
                        Some(ctx) => {
                            ctx.record_step(elapsed);
                            ctx.fiber = Some(fiber);
                            state.emit(EventKind::Yielded, &command);
                        }
                        None => teardown.fibers.push(fiber),
                    }
                    Ok(())
                }
                Step::Finished(Ok(())) => {
                    if let Some(ctx) = state.context_mut(run_id) {
                        ctx.record_step(elapsed);
                    }
                    state.complete(run_id, &mut teardown);
                    teardown.fibers.push(fiber);
                    Ok(())
                }
                Step::Finished(Err(error)) => {
                    state.fail(run_id, &error, &mut teardown);
                    teardown.fibers.push(fiber);
                    Err(CmdloopError::CommandFailed {
                        command: command.name().to_string(),
                        error,
                    })
                }
            }
        };
        self.settle(teardown);
        outcome
    }

    fn spawn_context(&self, run_id: RunId, command: &Command) -> Result<Fiber> {
        let weak = self.downgrade();
        let clock = self.shared.clock.clone();
        let owner = command.clone();
        Fiber::spawn(
            format!("{}-{run_id}", self.shared.options.thread_name_prefix),
            self.shared.options.stack_size,
            move |suspender| {
                let co = Coroutine::new(weak, clock, Some(owner.clone()), suspender);
                owner.run(&co)
            },
        )
    }

    /// Finish deferred work, then deliver events. Must be called unlocked.
    fn settle(&self, teardown: Teardown) {
        teardown.apply();
        self.flush_events();
    }

    fn flush_events(&self) {
        let events = self.shared.state.lock().take_events();
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self.shared.listeners.read().clone();
        for event in &events {
            for listener in &listeners {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                    error!(
                        %event,
                        panic = %panic_message(payload.as_ref()),
                        "event listener panicked"
                    );
                }
            }
        }
    }

    // ----- queries ------------------------------------------------------

    pub fn is_running(&self, command: &Command) -> bool {
        self.shared.state.lock().is_running(command)
    }

    pub fn is_scheduled(&self, command: &Command) -> bool {
        self.shared.state.lock().is_queued(command)
    }

    pub fn is_scheduled_or_running(&self, command: &Command) -> bool {
        self.shared.state.lock().is_scheduled_or_running(command)
    }

    /// Mounted commands in mount order.
    pub fn running_commands(&self) -> Vec<Command> {
        let state = self.shared.state.lock();
        state.running.iter().map(|c| c.command.clone()).collect()
    }

    /// Mounted commands that require `mechanism`, in mount order.
    pub fn running_commands_for(&self, mechanism: &Mechanism) -> Vec<Command> {
        let state = self.shared.state.lock();
        state
            .running
            .iter()
            .filter(|c| c.command.requires(mechanism))
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn queued_commands(&self) -> Vec<Command> {
        let state = self.shared.state.lock();
        state.queued.iter().map(|r| r.command.clone()).collect()
    }

    /// The command whose body is executing right now, if any.
    pub fn current_command(&self) -> Option<Command> {
        self.shared.state.lock().current().map(|(_, c)| c)
    }

    pub(crate) fn current_run(&self) -> Option<(RunId, Command)> {
        self.shared.state.lock().current()
    }

    pub(crate) fn is_run_live(&self, run_id: RunId) -> bool {
        self.shared.state.lock().context(run_id).is_some()
    }

    /// The command that forked or awaited `command`, if it is still mounted.
    pub fn parent_of(&self, command: &Command) -> Option<Command> {
        let state = self.shared.state.lock();
        let parent = state.context_of(command)?.parent?;
        state.context(parent).map(|c| c.command.clone())
    }

    /// Identifier of the current execution of `command`.
    pub fn run_id(&self, command: &Command) -> Option<u64> {
        self.shared.state.lock().context_of(command).map(|c| c.run_id)
    }

    /// Duration of the most recent step of a running command.
    pub fn last_runtime(&self, command: &Command) -> Option<Duration> {
        let state = self.shared.state.lock();
        state
            .context_of(command)
            .and_then(|c| c.last_runtime_us)
            .map(Duration::from_micros)
    }

    /// Sum of all step durations of the current execution of `command`.
    pub fn total_runtime(&self, command: &Command) -> Option<Duration> {
        let state = self.shared.state.lock();
        state
            .context_of(command)
            .map(|c| Duration::from_micros(c.total_runtime_us))
    }

    pub fn last_tick_runtime(&self) -> Duration {
        Duration::from_micros(self.shared.state.lock().last_tick_micros)
    }

    /// Number of ticks started so far.
    pub fn tick_count(&self) -> u64 {
        self.shared.state.lock().tick
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.shared.state.lock();
        SchedulerSnapshot {
            tick: state.tick,
            last_tick_runtime_us: state.last_tick_micros,
            queued: state
                .queued
                .iter()
                .map(|r| CommandSnapshot {
                    parent: r.parent,
                    ..CommandSnapshot::of(&r.command)
                })
                .collect(),
            running: state
                .running
                .iter()
                .map(|c| CommandSnapshot {
                    run_id: Some(c.run_id),
                    parent: c.parent,
                    last_runtime_us: c.last_runtime_us,
                    total_runtime_us: Some(c.total_runtime_us),
                    ..CommandSnapshot::of(&c.command)
                })
                .collect(),
        }
    }
}

/// Ends the current tick on drop, so a panic escaping user code called
/// directly by the tick (a trigger probe) does not wedge the scheduler.
struct TickGuard<'a> {
    shared: &'a Shared,
    started: u64,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.in_tick = false;
        state.last_tick_micros = self.shared.clock.now_micros().saturating_sub(self.started);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Scheduler")
            .field("tick", &state.tick)
            .field("queued", &state.queued.len())
            .field("running", &state.running.len())
            .finish()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.running.is_empty() {
            debug!(
                running = state.running.len(),
                "scheduler dropped with mounted commands; unwinding them"
            );
        }
    }
}
