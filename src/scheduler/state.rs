// src/scheduler/state.rs

//! Mount table and arbitration rules.
//!
//! Everything in here is synchronous and runs with the scheduler lock held.
//! Nothing in this module resumes a body, runs a hook, or calls a listener:
//! those are deferred through [`Teardown`] and the event outbox so that the
//! caller can perform them after unlocking.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::SharedClock;
use crate::command::{Command, Exit, Mechanism};
use crate::errors::{CmdloopError, Result};
use crate::scheduler::context::{Context, Request, RunId, Sideload, Teardown};
use crate::scheduler::events::{EventKind, SchedulerEvent};
use crate::trigger::TriggerCore;
use crate::types::ScheduleResult;

/// What [`State::admit`] decided for a schedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Rejected(ScheduleResult),
    Queued,
    /// Mounted as a child of the running context; the caller must run it.
    Mounted(RunId),
}

pub(crate) struct State {
    pub(crate) tick: u64,
    next_run_id: RunId,
    next_sideload_id: u64,
    pub(crate) queued: Vec<Request>,
    /// Mounted contexts in mount order.
    pub(crate) running: Vec<Context>,
    /// Contexts currently being resumed, outermost first.
    pub(crate) stack: Vec<RunId>,
    pub(crate) defaults: Vec<(Mechanism, Command)>,
    pub(crate) sideloads: Vec<Sideload>,
    pub(crate) triggers: Vec<Arc<TriggerCore>>,
    outbox: Vec<SchedulerEvent>,
    pub(crate) last_tick_micros: u64,
    pub(crate) in_tick: bool,
    clock: SharedClock,
}

impl State {
    pub(crate) fn new(clock: SharedClock) -> Self {
        Self {
            tick: 0,
            next_run_id: 1,
            next_sideload_id: 1,
            queued: Vec::new(),
            running: Vec::new(),
            stack: Vec::new(),
            defaults: Vec::new(),
            sideloads: Vec::new(),
            triggers: Vec::new(),
            outbox: Vec::new(),
            last_tick_micros: 0,
            in_tick: false,
            clock,
        }
    }

    // ----- events -------------------------------------------------------

    pub(crate) fn emit(&mut self, kind: EventKind, command: &Command) {
        let event = SchedulerEvent {
            kind,
            command: command.clone(),
            tick: self.tick,
            timestamp: Duration::from_micros(self.clock.now_micros()),
        };
        trace!(%event, "scheduler event");
        self.outbox.push(event);
    }

    pub(crate) fn take_events(&mut self) -> Vec<SchedulerEvent> {
        std::mem::take(&mut self.outbox)
    }

    // ----- lookups ------------------------------------------------------

    pub(crate) fn context(&self, run_id: RunId) -> Option<&Context> {
        self.running.iter().find(|c| c.run_id == run_id)
    }

    pub(crate) fn context_mut(&mut self, run_id: RunId) -> Option<&mut Context> {
        self.running.iter_mut().find(|c| c.run_id == run_id)
    }

    pub(crate) fn context_of(&self, command: &Command) -> Option<&Context> {
        self.running.iter().find(|c| c.command == *command)
    }

    pub(crate) fn is_running(&self, command: &Command) -> bool {
        self.context_of(command).is_some()
    }

    pub(crate) fn is_queued(&self, command: &Command) -> bool {
        self.queued.iter().any(|r| r.command == *command)
    }

    pub(crate) fn is_scheduled_or_running(&self, command: &Command) -> bool {
        self.is_queued(command) || self.is_running(command)
    }

    /// `start` and every mounted ancestor of it, nearest first.
    pub(crate) fn lineage(&self, start: Option<RunId>) -> Vec<RunId> {
        let mut out = Vec::new();
        let mut cursor = start;
        while let Some(id) = cursor {
            let Some(ctx) = self.context(id) else { break };
            out.push(id);
            cursor = ctx.parent;
        }
        out
    }

    /// Whether `command` is being resumed right now, or is an ancestor of a
    /// context that is.
    pub(crate) fn on_execution_path(&self, command: &Command) -> bool {
        self.stack.iter().any(|&id| {
            self.lineage(Some(id))
                .into_iter()
                .filter_map(|a| self.context(a))
                .any(|ctx| ctx.command == *command)
        })
    }

    /// Every mounted context in the order a tick resumes them: each tree
    /// descendants-first, newest child first, and unrelated trees in the
    /// order their roots were mounted.
    pub(crate) fn resume_order(&self) -> Vec<RunId> {
        let mut order = Vec::with_capacity(self.running.len());
        for root in &self.running {
            if root.parent.is_none_or(|p| self.context(p).is_none()) {
                self.push_subtree(root.run_id, &mut order);
            }
        }
        order
    }

    fn push_subtree(&self, run_id: RunId, order: &mut Vec<RunId>) {
        let children: Vec<RunId> = self
            .running
            .iter()
            .rev()
            .filter(|c| c.parent == Some(run_id))
            .map(|c| c.run_id)
            .collect();
        for child in children {
            self.push_subtree(child, order);
        }
        order.push(run_id);
    }

    /// Command of the innermost context being resumed.
    pub(crate) fn current(&self) -> Option<(RunId, Command)> {
        let id = *self.stack.last()?;
        self.context(id).map(|c| (id, c.command.clone()))
    }

    // ----- admission ----------------------------------------------------

    /// Decide what happens to a schedule request.
    ///
    /// With an empty execution stack the command is queued for the next
    /// promotion. From inside a running body it becomes a child of that body
    /// and is mounted immediately, preempting any conflicting context that is
    /// not one of its ancestors.
    pub(crate) fn admit(
        &mut self,
        command: &Command,
        scope: Option<RunId>,
        teardown: &mut Teardown,
    ) -> Admission {
        if self.is_scheduled_or_running(command) {
            return Admission::Rejected(ScheduleResult::AlreadyRunning);
        }

        let inline_parent = self.stack.last().copied();
        let parent = inline_parent.or(scope);
        let ancestors = self.lineage(parent);

        if let Some(blocker) = self.higher_priority_claimant(command, &ancestors) {
            debug!(command = %command, blocker = %blocker, "rejected: lower priority than running command");
            return Admission::Rejected(ScheduleResult::LowerPriorityThanRunningCommand);
        }

        match inline_parent {
            None => self.enqueue(command, parent),
            Some(_) => {
                self.emit(EventKind::Scheduled, command);
                self.evict_conflicts(command, &ancestors, teardown);
                Admission::Mounted(self.mount(command, parent))
            }
        }
    }

    /// Queue a newly registered default command as a top-level request, even
    /// when called from inside a running body.
    pub(crate) fn admit_default(&mut self, command: &Command) -> Admission {
        if self.is_scheduled_or_running(command) {
            return Admission::Rejected(ScheduleResult::AlreadyRunning);
        }
        if let Some(blocker) = self.higher_priority_claimant(command, &[]) {
            debug!(command = %command, blocker = %blocker, "default not queued: lower priority than running command");
            return Admission::Rejected(ScheduleResult::LowerPriorityThanRunningCommand);
        }
        self.enqueue(command, None)
    }

    /// Add a top-level request to the queue, displacing conflicting queued
    /// requests it outranks or ties with.
    fn enqueue(&mut self, command: &Command, parent: Option<RunId>) -> Admission {
        if let Some(blocker) = self
            .queued
            .iter()
            .find(|r| r.command.conflicts_with(command) && command.is_lower_priority_than(&r.command))
        {
            debug!(command = %command, blocker = %blocker.command, "rejected: lower priority than queued command");
            return Admission::Rejected(ScheduleResult::LowerPriorityThanRunningCommand);
        }

        let (evicted, kept): (Vec<Request>, Vec<Request>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|r| r.command.conflicts_with(command));
        self.queued = kept;
        for request in evicted {
            debug!(evicted = %request.command, by = %command, "queued command displaced");
            self.emit(EventKind::Interrupted { by: command.clone() }, &request.command);
        }

        self.emit(EventKind::Scheduled, command);
        self.queued.push(Request {
            command: command.clone(),
            parent,
        });
        Admission::Queued
    }

    fn higher_priority_claimant(&self, command: &Command, ancestors: &[RunId]) -> Option<&Command> {
        self.running
            .iter()
            .filter(|ctx| !ancestors.contains(&ctx.run_id))
            .map(|ctx| &ctx.command)
            .find(|other| other.conflicts_with(command) && command.is_lower_priority_than(other))
    }

    /// Mount every queued request that still wins arbitration.
    ///
    /// Requests scoped to a context that is no longer mounted are dropped.
    pub(crate) fn promote(&mut self, teardown: &mut Teardown) {
        for request in std::mem::take(&mut self.queued) {
            if let Some(parent) = request.parent
                && self.context(parent).is_none()
            {
                debug!(command = %request.command, "dropping request whose scope ended");
                continue;
            }
            if self.is_running(&request.command) {
                continue;
            }
            let ancestors = self.lineage(request.parent);
            if let Some(blocker) = self.higher_priority_claimant(&request.command, &ancestors) {
                debug!(command = %request.command, blocker = %blocker, "not promoted: lower priority than running command");
                continue;
            }
            self.evict_conflicts(&request.command, &ancestors, teardown);
            self.mount(&request.command, request.parent);
        }
    }

    /// Cancel every mounted tree that conflicts with `command`.
    ///
    /// The canceled unit is the highest ancestor of the conflicting context
    /// that is not itself an ancestor of `command`.
    fn evict_conflicts(&mut self, command: &Command, ancestors: &[RunId], teardown: &mut Teardown) {
        let mut roots: Vec<RunId> = Vec::new();
        for ctx in &self.running {
            if ancestors.contains(&ctx.run_id) || !ctx.command.conflicts_with(command) {
                continue;
            }
            let root = self.eviction_root(ctx.run_id, ancestors);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        for root in roots {
            if let Some(ctx) = self.context(root) {
                debug!(canceled = %ctx.command, by = %command, "preempting conflicting command");
            }
            self.terminate(root, Exit::Canceled, EventKind::Interrupted { by: command.clone() }, teardown);
        }
    }

    fn eviction_root(&self, run_id: RunId, ancestors: &[RunId]) -> RunId {
        let mut root = run_id;
        while let Some(parent) = self.context(root).and_then(|c| c.parent) {
            if ancestors.contains(&parent) || self.context(parent).is_none() {
                break;
            }
            root = parent;
        }
        root
    }

    fn mount(&mut self, command: &Command, parent: Option<RunId>) -> RunId {
        let run_id = self.next_run_id;
        self.next_run_id += 1;
        command.set_exit(Exit::Running);
        self.running.push(Context::new(run_id, command.clone(), parent));
        debug!(command = %command, run_id, ?parent, "mounted");
        self.emit(EventKind::Mounted, command);
        run_id
    }

    // ----- termination --------------------------------------------------

    /// Remove a context and cancel everything mounted beneath it.
    pub(crate) fn terminate(
        &mut self,
        run_id: RunId,
        exit: Exit,
        kind: EventKind,
        teardown: &mut Teardown,
    ) {
        let Some(index) = self.running.iter().position(|c| c.run_id == run_id) else {
            return;
        };
        let ctx = self.running.remove(index);
        ctx.command.set_exit(exit);
        if exit == Exit::Canceled
            && let Some(hook) = ctx.command.cancel_hook()
        {
            teardown.hooks.push((ctx.command.clone(), hook));
        }
        self.emit(kind, &ctx.command);
        teardown.contexts.push(ctx);
        self.cancel_children(run_id, teardown);
    }

    fn cancel_children(&mut self, parent: RunId, teardown: &mut Teardown) {
        let children: Vec<RunId> = self
            .running
            .iter()
            .filter(|c| c.parent == Some(parent))
            .map(|c| c.run_id)
            .collect();
        for child in children {
            self.terminate(child, Exit::Canceled, EventKind::Canceled, teardown);
        }
    }

    /// Body of `run_id` returned `Ok`.
    pub(crate) fn complete(&mut self, run_id: RunId, teardown: &mut Teardown) {
        let Some(ctx) = self.context(run_id) else { return };
        if ctx.abandoned {
            debug!(command = %ctx.command, "group gave up; reporting cancellation");
            self.terminate(run_id, Exit::Canceled, EventKind::Canceled, teardown);
        } else {
            debug!(command = %ctx.command, "completed");
            self.terminate(run_id, Exit::Completed, EventKind::Completed, teardown);
        }
    }

    /// Body of `run_id` failed. When nothing else is being resumed, the whole
    /// tree it belongs to is canceled as well.
    pub(crate) fn fail(&mut self, run_id: RunId, error: &anyhow::Error, teardown: &mut Teardown) {
        let Some(ctx) = self.context(run_id) else { return };
        let parent = ctx.parent;
        debug!(command = %ctx.command, error = %format!("{error:#}"), "failed");
        self.terminate(
            run_id,
            Exit::Failed,
            EventKind::Failed {
                error: format!("{error:#}"),
            },
            teardown,
        );
        if self.stack.is_empty()
            && let Some(&root) = self.lineage(parent).last()
        {
            self.terminate(root, Exit::Canceled, EventKind::Canceled, teardown);
        }
    }

    /// Explicit cancellation. Queued requests are dropped silently.
    pub(crate) fn cancel(&mut self, command: &Command, teardown: &mut Teardown) -> Result<()> {
        if self.on_execution_path(command) {
            return Err(CmdloopError::CancelWhileMounted {
                command: command.name().to_string(),
            });
        }
        self.queued.retain(|r| r.command != *command);
        if let Some(run_id) = self.context_of(command).map(|c| c.run_id) {
            debug!(command = %command, "canceled");
            self.terminate(run_id, Exit::Canceled, EventKind::Canceled, teardown);
        }
        Ok(())
    }

    pub(crate) fn cancel_all(&mut self, teardown: &mut Teardown) -> Result<()> {
        if let Some((_, command)) = self.current() {
            return Err(CmdloopError::CancelWhileMounted {
                command: command.name().to_string(),
            });
        }
        self.queued.clear();
        while let Some(first) = self.running.first().map(|c| c.run_id) {
            self.terminate(first, Exit::Canceled, EventKind::Canceled, teardown);
        }
        Ok(())
    }

    // ----- default commands ---------------------------------------------

    fn is_claimed(&self, mechanism: &Mechanism) -> bool {
        self.running.iter().any(|c| c.command.requires(mechanism))
            || self.queued.iter().any(|r| r.command.requires(mechanism))
    }

    /// Queue the default command of every mechanism nobody claims.
    pub(crate) fn queue_defaults(&mut self) {
        let idle: Vec<Command> = self
            .defaults
            .iter()
            .filter(|(mechanism, _)| !self.is_claimed(mechanism))
            .map(|(_, command)| command.clone())
            .collect();
        for command in idle {
            // A default may have been queued through another mechanism.
            if self.is_scheduled_or_running(&command) {
                continue;
            }
            trace!(command = %command, "queueing default command");
            self.emit(EventKind::Scheduled, &command);
            self.queued.push(Request {
                command,
                parent: None,
            });
        }
    }

    pub(crate) fn set_default(&mut self, mechanism: &Mechanism, command: Command) {
        match self.defaults.iter_mut().find(|(m, _)| m == mechanism) {
            Some(slot) => slot.1 = command,
            None => self.defaults.push((mechanism.clone(), command)),
        }
    }

    pub(crate) fn default_for(&self, mechanism: &Mechanism) -> Option<Command> {
        self.defaults
            .iter()
            .find(|(m, _)| m == mechanism)
            .map(|(_, c)| c.clone())
    }

    // ----- sideloads ----------------------------------------------------

    pub(crate) fn next_sideload_id(&mut self) -> u64 {
        let id = self.next_sideload_id;
        self.next_sideload_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coroutine::Coroutine;

    fn state() -> State {
        State::new(Arc::new(ManualClock::new()))
    }

    fn cmd(name: &str, reqs: &[&Mechanism], priority: i32) -> Command {
        Command::new(name, reqs.iter().map(|m| (*m).clone()), |_: &Coroutine| Ok(()))
            .with_priority(priority)
    }

    #[test]
    fn queue_keeps_the_winner_of_conflicting_requests() {
        let mut state = state();
        let mut teardown = Teardown::default();
        let arm = Mechanism::new("Arm");
        let low = cmd("Low", &[&arm], 1);
        let high = cmd("High", &[&arm], 2);
        let other = cmd("Other", &[&arm], 1);

        assert_eq!(state.admit(&low, None, &mut teardown), Admission::Queued);
        assert_eq!(state.admit(&high, None, &mut teardown), Admission::Queued);
        assert_eq!(
            state.admit(&other, None, &mut teardown),
            Admission::Rejected(ScheduleResult::LowerPriorityThanRunningCommand)
        );
        assert_eq!(
            state.admit(&high, None, &mut teardown),
            Admission::Rejected(ScheduleResult::AlreadyRunning)
        );

        let queued: Vec<&str> = state.queued.iter().map(|r| r.command.name()).collect();
        assert_eq!(queued, ["High"]);
    }

    #[test]
    fn promotion_evicts_whole_conflicting_trees() {
        let mut state = state();
        let mut teardown = Teardown::default();
        let arm = Mechanism::new("Arm");
        let parent = cmd("Parent", &[&arm], 0);
        let child = cmd("Child", &[&arm], 0);
        let intruder = cmd("Intruder", &[&arm], 0);

        let parent_id = state.mount(&parent, None);
        state.mount(&child, Some(parent_id));

        state.admit(&intruder, None, &mut teardown);
        state.promote(&mut teardown);

        let running: Vec<&str> = state.running.iter().map(|c| c.command.name()).collect();
        assert_eq!(running, ["Intruder"]);
        assert_eq!(parent.last_exit(), Exit::Canceled);
        assert_eq!(child.last_exit(), Exit::Canceled);
        assert_eq!(teardown.contexts.len(), 2);
    }

    #[test]
    fn resume_order_puts_children_first_and_keeps_root_order() {
        let mut state = state();
        let a = cmd("A", &[], 0);
        let a1 = cmd("A1", &[], 0);
        let a1x = cmd("A1x", &[], 0);
        let a2 = cmd("A2", &[], 0);
        let b = cmd("B", &[], 0);

        let a_id = state.mount(&a, None);
        let a1_id = state.mount(&a1, Some(a_id));
        let b_id = state.mount(&b, None);
        let a2_id = state.mount(&a2, Some(a_id));
        let a1x_id = state.mount(&a1x, Some(a1_id));

        assert_eq!(state.resume_order(), [a2_id, a1x_id, a1_id, a_id, b_id]);
    }

    #[test]
    fn scoped_requests_die_with_their_scope() {
        let mut state = state();
        let mut teardown = Teardown::default();
        let scope = cmd("Scope", &[], 0);
        let bound = cmd("Bound", &[], 0);

        let scope_id = state.mount(&scope, None);
        state.admit(&bound, Some(scope_id), &mut teardown);
        state.cancel(&scope, &mut teardown).unwrap();
        state.promote(&mut teardown);

        assert!(state.running.is_empty());
    }

    #[test]
    fn replacement_default_is_queued_against_a_running_default() {
        let mut state = state();
        let mut teardown = Teardown::default();
        let arm = Mechanism::new("Arm");
        let old = cmd("Old Idle", &[&arm], 0);
        let new = cmd("New Idle", &[&arm], 0);
        let boss = cmd("Boss", &[&arm], 5);

        state.set_default(&arm, old.clone());
        state.mount(&old, None);
        state.set_default(&arm, new.clone());
        assert_eq!(state.admit_default(&new), Admission::Queued);
        state.promote(&mut teardown);

        let running: Vec<&str> = state.running.iter().map(|c| c.command.name()).collect();
        assert_eq!(running, ["New Idle"]);

        state.mount(&boss, None);
        let lower = cmd("Lower Idle", &[&arm], 0);
        assert_eq!(
            state.admit_default(&lower),
            Admission::Rejected(ScheduleResult::LowerPriorityThanRunningCommand)
        );
    }

    #[test]
    fn defaults_fill_only_unclaimed_mechanisms() {
        let mut state = state();
        let arm = Mechanism::new("Arm");
        let drive = Mechanism::new("Drive");
        let arm_idle = cmd("ArmIdle", &[&arm], 0);
        let drive_idle = cmd("DriveIdle", &[&drive], 0);
        let user = cmd("User", &[&arm], 0);

        state.set_default(&arm, arm_idle);
        state.set_default(&drive, drive_idle);
        state.mount(&user, None);
        state.queue_defaults();
        state.queue_defaults();

        let queued: Vec<&str> = state.queued.iter().map(|r| r.command.name()).collect();
        assert_eq!(queued, ["DriveIdle"]);
    }
}
