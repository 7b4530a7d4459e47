// src/command/parallel.rs

use std::collections::HashSet;

use super::{Command, CommandKind, Exit, max_priority, union_of};
use crate::coroutine::Coroutine;
use crate::errors::{CmdloopError, Result};
use crate::types::ScheduleResult;

impl Command {
    /// Run `required` and `races` side by side.
    ///
    /// The group ends when every required child has finished, or as soon as
    /// any race child completes (the remaining children are canceled with
    /// it). If a required child is canceled from outside, the group cancels
    /// itself. No two children may share a mechanism; that is checked when
    /// the group is mounted.
    pub fn parallel(
        name: impl Into<String>,
        required: impl IntoIterator<Item = Command>,
        races: impl IntoIterator<Item = Command>,
    ) -> Self {
        let required: Vec<Command> = required.into_iter().collect();
        let races: Vec<Command> = races.into_iter().collect();
        let all: Vec<Command> = required.iter().chain(&races).cloned().collect();
        Self::from_parts(
            name.into(),
            max_priority(&all),
            union_of(&all),
            CommandKind::Parallel { required, races },
        )
    }

    /// Every child must finish.
    pub fn all_of(name: impl Into<String>, children: impl IntoIterator<Item = Command>) -> Self {
        Self::parallel(name, children, [])
    }

    /// The first child to complete ends the group.
    pub fn race(name: impl Into<String>, children: impl IntoIterator<Item = Command>) -> Self {
        Self::parallel(name, [], children)
    }
}

/// Fail with the first pair of commands that share a mechanism.
pub(crate) fn ensure_disjoint<'a>(commands: impl IntoIterator<Item = &'a Command>) -> Result<()> {
    let commands: Vec<&Command> = commands.into_iter().collect();
    for (i, first) in commands.iter().enumerate() {
        for second in &commands[i + 1..] {
            if let Some(mechanism) = first.shared_requirement(second) {
                return Err(CmdloopError::ConflictingRequirements {
                    first: first.name().to_string(),
                    second: second.name().to_string(),
                    mechanism: mechanism.name().to_string(),
                });
            }
        }
    }
    Ok(())
}

pub(super) fn run(required: &[Command], races: &[Command], co: &Coroutine) -> anyhow::Result<()> {
    ensure_disjoint(required.iter().chain(races))?;

    // Children that lost arbitration never run; they count as completed.
    let mut rejected: HashSet<Command> = HashSet::new();
    for child in required.iter().chain(races) {
        if co.scheduler().schedule(child)? == ScheduleResult::LowerPriorityThanRunningCommand {
            rejected.insert(child.clone());
        }
    }

    loop {
        let finished = |child: &Command| rejected.contains(child) || !co.is_pending(child);
        let completed = |child: &Command| {
            rejected.contains(child) || (finished(child) && child.last_exit() == Exit::Completed)
        };

        if races.iter().any(completed) {
            return Ok(());
        }
        if required
            .iter()
            .any(|child| finished(child) && !completed(child))
        {
            co.abandon();
            return Ok(());
        }
        if required.iter().chain(races).all(finished) {
            return Ok(());
        }

        co.yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Mechanism;

    fn leaf(name: &str, reqs: &[&Mechanism]) -> Command {
        Command::new(name, reqs.iter().map(|m| (*m).clone()), |_: &Coroutine| Ok(()))
    }

    #[test]
    fn disjoint_children_pass_validation() {
        let arm = Mechanism::new("Arm");
        let drive = Mechanism::new("Drive");
        let children = [leaf("A", &[&arm]), leaf("B", &[&drive]), leaf("C", &[])];

        assert!(ensure_disjoint(&children).is_ok());
    }

    #[test]
    fn overlapping_children_name_both_commands_and_the_mechanism() {
        let mech = Mechanism::new("The Mechanism");
        let children = [leaf("First", &[&mech]), leaf("Second", &[&mech])];

        let err = ensure_disjoint(&children).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Commands running in parallel cannot share requirements: \
             First and Second both require The Mechanism"
        );
    }
}
