// src/coroutine/mod.rs

//! The suspension handle handed to every running body.
//!
//! A body runs on its own execution context (see [`fiber`]), so it may
//! suspend from any call depth: inside loops, helpers, or nested closures.
//! Suspension points are exactly [`Coroutine::yield_now`], [`Coroutine::park`],
//! [`Coroutine::wait`], [`Coroutine::wait_until`] and the blocking loops inside
//! the `await_*` family.

pub(crate) mod fiber;

use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use crate::clock::{SharedClock, duration_to_micros};
use crate::command::Command;
use crate::command::ensure_disjoint;
use crate::errors::Result;
use crate::scheduler::{Scheduler, Shared};

pub(crate) use fiber::{Fiber, Step, Suspender, panic_message};

pub struct Coroutine {
    scheduler: Weak<Shared>,
    clock: SharedClock,
    owner: Option<Command>,
    suspender: Suspender,
}

impl Coroutine {
    pub(crate) fn new(
        scheduler: Weak<Shared>,
        clock: SharedClock,
        owner: Option<Command>,
        suspender: Suspender,
    ) -> Self {
        Self {
            scheduler,
            clock,
            owner,
            suspender,
        }
    }

    /// Suspend until the next tick in which this context is resumed.
    pub fn yield_now(&self) {
        self.suspender.suspend();
    }

    /// Suspend forever. The body only ends by being canceled.
    pub fn park(&self) -> ! {
        loop {
            self.yield_now();
        }
    }

    /// Suspend until at least `duration` has passed on the scheduler clock.
    ///
    /// Always suspends at least once, even for a zero duration; the deadline
    /// is re-checked once per tick.
    pub fn wait(&self, duration: Duration) {
        let start = self.clock.now_micros();
        let needed = duration_to_micros(duration);
        loop {
            self.yield_now();
            if self.clock.now_micros().saturating_sub(start) >= needed {
                return;
            }
        }
    }

    /// Suspend until `condition` holds. Checked before the first suspension.
    pub fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        while !condition() {
            self.yield_now();
        }
    }

    /// Mount each command as a child of this one and run it up to its first
    /// suspension before returning. The children are not awaited.
    ///
    /// A child that conflicts with a sibling preempts it through the normal
    /// priority rules; this is never an error. A child that fails during its
    /// first step is reported here.
    pub fn fork<'a>(&self, commands: impl IntoIterator<Item = &'a Command>) -> Result<()> {
        let scheduler = self.scheduler();
        for command in commands {
            scheduler.schedule(command)?;
        }
        Ok(())
    }

    /// Block this body until `command` terminates.
    ///
    /// The command is forked first unless it is already queued or running.
    /// A command that loses priority arbitration counts as finished.
    pub fn await_command(&self, command: &Command) -> Result<()> {
        if !self.is_pending(command) {
            self.scheduler().schedule(command)?;
        }
        while self.is_pending(command) {
            self.yield_now();
        }
        Ok(())
    }

    /// Block until every command terminates.
    ///
    /// Fails without scheduling anything if two of the commands share a
    /// mechanism.
    pub fn await_all<'a>(&self, commands: impl IntoIterator<Item = &'a Command>) -> Result<()> {
        let commands: Vec<&Command> = commands.into_iter().collect();
        ensure_disjoint(commands.iter().copied())?;

        for command in &commands {
            if !self.is_pending(command) {
                self.scheduler().schedule(command)?;
            }
        }
        while commands.iter().any(|c| self.is_pending(c)) {
            self.yield_now();
        }
        Ok(())
    }

    /// Block until the first of `commands` terminates, then cancel the rest.
    ///
    /// Same mechanism check as [`await_all`](Coroutine::await_all).
    pub fn await_any<'a>(&self, commands: impl IntoIterator<Item = &'a Command>) -> Result<()> {
        let commands: Vec<&Command> = commands.into_iter().collect();
        ensure_disjoint(commands.iter().copied())?;
        if commands.is_empty() {
            return Ok(());
        }

        for command in &commands {
            if !self.is_pending(command) {
                self.scheduler().schedule(command)?;
            }
        }
        while commands.iter().all(|c| self.is_pending(c)) {
            self.yield_now();
        }

        let scheduler = self.scheduler();
        for command in commands {
            scheduler.cancel(command)?;
        }
        Ok(())
    }

    /// The scheduler running this body.
    pub fn scheduler(&self) -> Scheduler {
        match self.scheduler.upgrade() {
            Some(shared) => Scheduler::from_shared(shared),
            // The scheduler is gone; nothing will ever resume this body.
            None => fiber::unwind(),
        }
    }

    /// The command this body belongs to, `None` for a sideload.
    pub fn command(&self) -> Option<&Command> {
        self.owner.as_ref()
    }

    /// Time on the scheduler clock.
    pub fn now(&self) -> Duration {
        Duration::from_micros(self.clock.now_micros())
    }

    pub(crate) fn is_pending(&self, command: &Command) -> bool {
        self.scheduler().is_scheduled_or_running(command)
    }

    /// Mark the owning command as canceled once its body returns.
    pub(crate) fn abandon(&self) {
        if let Some(owner) = &self.owner {
            self.scheduler().abandon(owner);
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("command", &self.owner.as_ref().map(Command::name))
            .finish_non_exhaustive()
    }
}
