// src/command/mod.rs

//! Commands: named, prioritized units of work that claim mechanisms.
//!
//! A [`Command`] is cheap to clone and compared by identity, never by name.
//! The same object can be scheduled again after it terminates; each schedule
//! gets a fresh execution context.
//!
//! Four shapes exist, all behind the same handle:
//! - a leaf, whose body is a closure receiving a [`Coroutine`];
//! - a sequence ([`Command::sequence`]), running children one after another;
//! - a parallel group ([`Command::parallel`], [`Command::all_of`],
//!   [`Command::race`]);
//! - a state machine, built with [`StateMachine`].

mod mechanism;
mod parallel;
mod sequence;
mod state_machine;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub use mechanism::Mechanism;
pub(crate) use parallel::ensure_disjoint;
pub use state_machine::{State, StateMachine, TransitionFrom, TransitionTo};

use crate::coroutine::Coroutine;

/// Priority given to commands that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 0;

pub(crate) type Body = Arc<dyn Fn(&Coroutine) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

struct CommandInner {
    name: String,
    priority: i32,
    requirements: Vec<Mechanism>,
    kind: CommandKind,
    on_cancel: Option<Hook>,
    last_exit: AtomicU8,
}

// A builder copy is a new command, so it starts without exit history.
impl Clone for CommandInner {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            priority: self.priority,
            requirements: self.requirements.clone(),
            kind: self.kind.clone(),
            on_cancel: self.on_cancel.clone(),
            last_exit: AtomicU8::new(Exit::Idle as u8),
        }
    }
}

#[derive(Clone)]
enum CommandKind {
    Leaf(Body),
    Sequence(Vec<Command>),
    Parallel {
        required: Vec<Command>,
        races: Vec<Command>,
    },
    StateMachine(Arc<state_machine::Machine>),
}

/// How the most recent execution of a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Exit {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Canceled = 3,
    Failed = 4,
}

impl Exit {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Exit::Running,
            2 => Exit::Completed,
            3 => Exit::Canceled,
            4 => Exit::Failed,
            _ => Exit::Idle,
        }
    }
}

impl Command {
    /// A leaf command. `requirements` is deduplicated; order is kept.
    pub fn new<F>(
        name: impl Into<String>,
        requirements: impl IntoIterator<Item = Mechanism>,
        body: F,
    ) -> Self
    where
        F: Fn(&Coroutine) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::from_parts(
            name.into(),
            DEFAULT_PRIORITY,
            dedup(requirements),
            CommandKind::Leaf(Arc::new(body)),
        )
    }

    /// A leaf command that claims nothing.
    pub fn no_requirements<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&Coroutine) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(name, [], body)
    }

    /// A command that claims `requirements` and never finishes on its own.
    pub fn idle(name: impl Into<String>, requirements: impl IntoIterator<Item = Mechanism>) -> Self {
        Self::new(name, requirements, |co: &Coroutine| -> anyhow::Result<()> {
            co.park()
        })
    }

    fn from_parts(
        name: String,
        priority: i32,
        requirements: Vec<Mechanism>,
        kind: CommandKind,
    ) -> Self {
        Self {
            inner: Arc::new(CommandInner {
                name,
                priority,
                requirements,
                kind,
                on_cancel: None,
                last_exit: AtomicU8::new(Exit::Idle as u8),
            }),
        }
    }

    /// Copy of this command with a different priority.
    ///
    /// The result is a distinct command; the original keeps its priority.
    pub fn with_priority(self, priority: i32) -> Self {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        inner.priority = priority;
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Copy of this command that runs `hook` when an execution is canceled.
    ///
    /// The hook never runs on normal completion, on failure, or for a
    /// command that was only queued.
    pub fn when_canceled<F>(self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = Arc::unwrap_or_clone(self.inner);
        inner.on_cancel = Some(Arc::new(hook));
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn requirements(&self) -> &[Mechanism] {
        &self.inner.requirements
    }

    pub fn requires(&self, mechanism: &Mechanism) -> bool {
        self.inner.requirements.contains(mechanism)
    }

    /// First mechanism both commands require, in `self`'s declaration order.
    pub fn shared_requirement(&self, other: &Command) -> Option<&Mechanism> {
        self.inner
            .requirements
            .iter()
            .find(|m| other.requires(m))
    }

    pub fn conflicts_with(&self, other: &Command) -> bool {
        self.shared_requirement(other).is_some()
    }

    pub fn is_lower_priority_than(&self, other: &Command) -> bool {
        self.inner.priority < other.inner.priority
    }

    /// Direct children of a composition, empty for a leaf.
    pub fn children(&self) -> Vec<Command> {
        match &self.inner.kind {
            CommandKind::Leaf(_) => Vec::new(),
            CommandKind::Sequence(children) => children.clone(),
            CommandKind::Parallel { required, races } => {
                required.iter().chain(races).cloned().collect()
            }
            CommandKind::StateMachine(machine) => machine.commands(),
        }
    }

    pub(crate) fn run(&self, co: &Coroutine) -> anyhow::Result<()> {
        match &self.inner.kind {
            CommandKind::Leaf(body) => body(co),
            CommandKind::Sequence(children) => sequence::run(children, co),
            CommandKind::Parallel { required, races } => parallel::run(required, races, co),
            CommandKind::StateMachine(machine) => state_machine::run(machine, co),
        }
    }

    pub(crate) fn cancel_hook(&self) -> Option<Hook> {
        self.inner.on_cancel.clone()
    }

    pub(crate) fn last_exit(&self) -> Exit {
        Exit::from_u8(self.inner.last_exit.load(Ordering::SeqCst))
    }

    pub(crate) fn set_exit(&self, exit: Exit) {
        self.inner.last_exit.store(exit as u8, Ordering::SeqCst);
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

/// Requirement union of `children`, in first-seen order.
fn union_of(children: &[Command]) -> Vec<Mechanism> {
    dedup(
        children
            .iter()
            .flat_map(|c| c.requirements().iter().cloned()),
    )
}

fn max_priority(children: &[Command]) -> i32 {
    children
        .iter()
        .map(Command::priority)
        .max()
        .unwrap_or(DEFAULT_PRIORITY)
}

fn dedup(requirements: impl IntoIterator<Item = Mechanism>) -> Vec<Mechanism> {
    let mut out: Vec<Mechanism> = Vec::new();
    for mechanism in requirements {
        if !out.contains(&mechanism) {
            out.push(mechanism);
        }
    }
    out
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Command {}

impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner.kind {
            CommandKind::Leaf(_) => "leaf",
            CommandKind::Sequence(_) => "sequence",
            CommandKind::Parallel { .. } => "parallel",
            CommandKind::StateMachine(_) => "state machine",
        };
        f.debug_struct("Command")
            .field("name", &self.inner.name)
            .field("kind", &kind)
            .field("priority", &self.inner.priority)
            .field("requirements", &self.inner.requirements)
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &Coroutine) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn identity_not_name_decides_equality() {
        let a = Command::no_requirements("Same", noop);
        let b = Command::no_requirements("Same", noop);

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn builders_produce_new_commands() {
        let base = Command::no_requirements("Base", noop);
        let keep = base.clone();
        let bumped = base.with_priority(7);

        assert_eq!(keep.priority(), DEFAULT_PRIORITY);
        assert_eq!(bumped.priority(), 7);
        assert_ne!(keep, bumped);
    }

    #[test]
    fn requirements_are_deduplicated_and_compared_by_identity() {
        let arm = Mechanism::new("Arm");
        let other_arm = Mechanism::new("Arm");
        let a = Command::new("A", [arm.clone(), arm.clone()], noop);
        let b = Command::new("B", [other_arm], noop);
        let c = Command::new("C", [arm.clone()], noop);

        assert_eq!(a.requirements().len(), 1);
        assert!(!a.conflicts_with(&b));
        assert_eq!(a.shared_requirement(&c), Some(&arm));
    }

    #[test]
    fn compositions_take_union_and_max_priority() {
        let arm = Mechanism::new("Arm");
        let drive = Mechanism::new("Drive");
        let first = Command::new("First", [arm.clone()], noop).with_priority(3);
        let second = Command::new("Second", [drive.clone(), arm.clone()], noop).with_priority(9);

        let seq = Command::sequence("Seq", [first.clone(), second.clone()]);
        assert_eq!(seq.requirements(), &[arm.clone(), drive.clone()]);
        assert_eq!(seq.priority(), 9);

        let group = Command::race("Race", [first, second]);
        assert_eq!(group.requirements(), &[arm, drive]);
        assert_eq!(group.priority(), 9);

        let empty = Command::all_of("Empty", []);
        assert!(empty.requirements().is_empty());
        assert_eq!(empty.priority(), DEFAULT_PRIORITY);
    }

    #[test]
    fn exit_cell_is_reset_on_builder_copy() {
        let cmd = Command::no_requirements("C", noop);
        cmd.set_exit(Exit::Completed);
        let copy = cmd.clone().with_priority(1);

        assert_eq!(cmd.last_exit(), Exit::Completed);
        assert_eq!(copy.last_exit(), Exit::Idle);
    }
}
