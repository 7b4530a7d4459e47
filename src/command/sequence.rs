// src/command/sequence.rs

use super::{Command, CommandKind, max_priority, union_of};
use crate::coroutine::Coroutine;

impl Command {
    /// Run `children` one after another.
    ///
    /// Exactly one child is mounted at a time. A child that loses priority
    /// arbitration counts as finished and the sequence moves on.
    pub fn sequence(name: impl Into<String>, children: impl IntoIterator<Item = Command>) -> Self {
        let children: Vec<Command> = children.into_iter().collect();
        Self::from_parts(
            name.into(),
            max_priority(&children),
            union_of(&children),
            CommandKind::Sequence(children),
        )
    }
}

pub(super) fn run(children: &[Command], co: &Coroutine) -> anyhow::Result<()> {
    for child in children {
        co.await_command(child)?;
    }
    Ok(())
}
