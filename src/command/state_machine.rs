// src/command/state_machine.rs

//! A composition that moves between states, each running one command.
//!
//! ```text
//! let mut machine = StateMachine::new("Intake");
//! let seek = machine.add_state(seek_cmd);
//! let hold = machine.add_state(hold_cmd);
//! machine.set_initial_state(seek)?;
//! machine.switch_from(seek).to(hold)?.when(move || sensor.has_piece());
//! machine.switch_from(hold).to_exit()?.when_complete_and(move || done.get());
//! let command = machine.build()?;
//! ```
//!
//! Per step of the machine body, the transitions of the current state are
//! checked in declaration order; the first whose condition has a rising edge
//! cancels the state's command and enters the target state in the same step.
//! When the state's command ends on its own, the first completion whose
//! condition holds picks the next state; with none, the machine ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{Command, CommandKind, Hook, max_priority, union_of};
use crate::coroutine::Coroutine;
use crate::errors::{CmdloopError, Result};

type Condition = Arc<dyn Fn() -> bool + Send + Sync>;

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one state of one [`StateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct State {
    machine: u64,
    index: usize,
}

/// Builder for a state-machine [`Command`].
pub struct StateMachine {
    id: u64,
    name: String,
    states: Vec<StateSpec>,
    transitions: Vec<Transition>,
    initial: Option<usize>,
}

struct StateSpec {
    command: Command,
    /// Indices into the machine's transition table, in declaration order.
    transitions: Vec<usize>,
    completions: Vec<Completion>,
    on_enter: Vec<Hook>,
    on_exit: Vec<Hook>,
}

/// `target == None` leaves the machine.
struct Transition {
    target: Option<usize>,
    condition: Condition,
}

struct Completion {
    target: Option<usize>,
    condition: Condition,
}

/// The frozen graph a built machine runs.
pub(super) struct Machine {
    states: Vec<StateSpec>,
    transitions: Vec<Transition>,
    initial: usize,
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a state that runs `command` while the machine is in it.
    #[must_use]
    pub fn add_state(&mut self, command: Command) -> State {
        self.states.push(StateSpec {
            command,
            transitions: Vec::new(),
            completions: Vec::new(),
            on_enter: Vec::new(),
            on_exit: Vec::new(),
        });
        State {
            machine: self.id,
            index: self.states.len() - 1,
        }
    }

    /// Choose where the machine starts. A later call replaces an earlier one.
    pub fn set_initial_state(&mut self, state: State) -> Result<()> {
        self.initial = Some(self.index_of(state)?);
        Ok(())
    }

    /// Run `callback` every time `state` is entered, after its command is
    /// started.
    pub fn on_enter<F>(&mut self, state: State, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let index = self.index_of(state)?;
        self.states[index].on_enter.push(Arc::new(callback));
        Ok(())
    }

    /// Run `callback` every time `state` is left, by a transition or because
    /// its command ended.
    pub fn on_exit<F>(&mut self, state: State, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let index = self.index_of(state)?;
        self.states[index].on_exit.push(Arc::new(callback));
        Ok(())
    }

    /// Start a transition out of `state`.
    pub fn switch_from(&mut self, state: State) -> TransitionFrom<'_> {
        TransitionFrom {
            machine: self,
            from: vec![state],
        }
    }

    /// Start a transition shared by `states`; an empty list means every state
    /// added so far.
    pub fn switch_from_any(&mut self, states: impl IntoIterator<Item = State>) -> TransitionFrom<'_> {
        let mut from: Vec<State> = states.into_iter().collect();
        if from.is_empty() {
            from = (0..self.states.len())
                .map(|index| State {
                    machine: self.id,
                    index,
                })
                .collect();
        }
        TransitionFrom {
            machine: self,
            from,
        }
    }

    /// Freeze the machine into a command.
    ///
    /// The command requires every mechanism its states' commands require and
    /// takes the highest of their priorities.
    pub fn build(self) -> Result<Command> {
        let Some(initial) = self.initial else {
            return Err(self.invalid("no initial state; call set_initial_state first"));
        };
        let commands: Vec<Command> = self.states.iter().map(|s| s.command.clone()).collect();
        Ok(Command::from_parts(
            self.name,
            max_priority(&commands),
            union_of(&commands),
            CommandKind::StateMachine(Arc::new(Machine {
                states: self.states,
                transitions: self.transitions,
                initial,
            })),
        ))
    }

    fn index_of(&self, state: State) -> Result<usize> {
        if state.machine != self.id || state.index >= self.states.len() {
            return Err(self.invalid("state belongs to a different state machine"));
        }
        Ok(state.index)
    }

    fn invalid(&self, reason: &str) -> CmdloopError {
        CmdloopError::InvalidStateMachine {
            machine: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// First stage of a transition: the states it leaves from.
#[must_use = "use .to() or .to_exit() to pick where the transition goes"]
pub struct TransitionFrom<'a> {
    machine: &'a mut StateMachine,
    from: Vec<State>,
}

impl<'a> TransitionFrom<'a> {
    pub fn to(self, target: State) -> Result<TransitionTo<'a>> {
        let target = self.machine.index_of(target)?;
        self.resolve(Some(target))
    }

    /// The transition ends the machine.
    pub fn to_exit(self) -> Result<TransitionTo<'a>> {
        self.resolve(None)
    }

    fn resolve(self, target: Option<usize>) -> Result<TransitionTo<'a>> {
        let from = self
            .from
            .iter()
            .map(|&state| self.machine.index_of(state))
            .collect::<Result<Vec<usize>>>()?;
        Ok(TransitionTo {
            machine: self.machine,
            from,
            target,
        })
    }
}

/// Second stage of a transition: what makes it fire.
#[must_use = "use .when(), .when_complete() or .when_complete_and() to add the transition"]
pub struct TransitionTo<'a> {
    machine: &'a mut StateMachine,
    from: Vec<usize>,
    target: Option<usize>,
}

impl TransitionTo<'_> {
    /// Fire on a rising edge of `condition` while the state's command runs.
    pub fn when<F>(self, condition: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let id = self.machine.transitions.len();
        self.machine.transitions.push(Transition {
            target: self.target,
            condition: Arc::new(condition),
        });
        for index in self.from {
            self.machine.states[index].transitions.push(id);
        }
    }

    /// Move on when the state's command ends on its own.
    pub fn when_complete(self) {
        // Leaving the machine is already what happens without a completion.
        if self.target.is_none() {
            return;
        }
        self.when_complete_and(|| true);
    }

    /// Move on when the state's command ends on its own and `condition`
    /// holds at that moment.
    pub fn when_complete_and<F>(self, condition: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let condition: Condition = Arc::new(condition);
        for index in self.from {
            self.machine.states[index].completions.push(Completion {
                target: self.target,
                condition: condition.clone(),
            });
        }
    }
}

impl Machine {
    pub(super) fn commands(&self) -> Vec<Command> {
        self.states.iter().map(|s| s.command.clone()).collect()
    }
}

impl StateSpec {
    fn enter(&self) {
        self.on_enter.iter().for_each(|callback| callback());
    }

    fn exit(&self) {
        self.on_exit.iter().for_each(|callback| callback());
    }

    fn next_on_complete(&self) -> Option<usize> {
        self.completions
            .iter()
            .find(|c| (c.condition)())
            .and_then(|c| c.target)
    }
}

pub(super) fn run(machine: &Machine, co: &Coroutine) -> anyhow::Result<()> {
    // Last sampled value of each transition condition, for edge detection.
    let mut previous = vec![false; machine.transitions.len()];
    let mut current = Some(machine.initial);

    'states: while let Some(index) = current {
        let state = &machine.states[index];
        co.fork([&state.command])?;
        state.enter();

        let mut yielded = false;
        while co.is_pending(&state.command) {
            for &id in &state.transitions {
                let transition = &machine.transitions[id];
                let value = (transition.condition)();
                let rising = value && !previous[id];
                previous[id] = value;
                if rising {
                    debug!(state = %state.command, target = ?transition.target, "state transition");
                    state.exit();
                    co.scheduler().cancel(&state.command)?;
                    current = transition.target;
                    continue 'states;
                }
            }
            co.yield_now();
            yielded = true;
        }

        state.exit();
        current = state.next_on_complete();
        // A state whose command finished inside the fork still costs one step.
        if !yielded && current.is_some() {
            co.yield_now();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Mechanism;

    fn leaf(name: &str, reqs: &[&Mechanism]) -> Command {
        Command::new(name, reqs.iter().map(|m| (*m).clone()), |_: &Coroutine| Ok(()))
    }

    #[test]
    fn build_requires_an_initial_state() {
        let mut machine = StateMachine::new("Machine");
        let _ = machine.add_state(leaf("Only", &[]));

        let err = machine.build().unwrap_err();
        assert!(matches!(err, CmdloopError::InvalidStateMachine { ref machine, .. } if machine == "Machine"));
    }

    #[test]
    fn states_of_another_machine_are_rejected() {
        let mut first = StateMachine::new("First");
        let mut second = StateMachine::new("Second");
        let foreign = second.add_state(leaf("Foreign", &[]));
        let own = first.add_state(leaf("Own", &[]));

        assert!(first.set_initial_state(foreign).is_err());
        assert!(first.switch_from(own).to(foreign).is_err());
        assert!(first.switch_from(foreign).to_exit().is_err());
        assert!(first.on_enter(foreign, || {}).is_err());
        assert!(first.set_initial_state(own).is_ok());
    }

    #[test]
    fn machine_takes_union_of_requirements_and_max_priority() -> Result<()> {
        let arm = Mechanism::new("Arm");
        let drive = Mechanism::new("Drive");
        let mut machine = StateMachine::new("Machine");
        let a = machine.add_state(leaf("A", &[&arm]).with_priority(2));
        let _ = machine.add_state(leaf("B", &[&drive, &arm]).with_priority(5));
        machine.set_initial_state(a)?;

        let command = machine.build()?;
        assert_eq!(command.requirements(), &[arm, drive]);
        assert_eq!(command.priority(), 5);
        assert_eq!(command.children().len(), 2);
        Ok(())
    }

    #[test]
    fn switch_from_any_with_no_states_covers_every_state() -> Result<()> {
        let mut machine = StateMachine::new("Machine");
        let a = machine.add_state(leaf("A", &[]));
        let b = machine.add_state(leaf("B", &[]));
        machine.switch_from_any([]).to(a)?.when(|| false);
        machine.switch_from(b).to_exit()?.when_complete();

        assert_eq!(machine.states[0].transitions, [0]);
        assert_eq!(machine.states[1].transitions, [0]);
        // Exiting on completion is the default and adds nothing.
        assert!(machine.states[1].completions.is_empty());
        Ok(())
    }
}
