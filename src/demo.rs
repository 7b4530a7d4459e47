// src/demo.rs

//! A small simulated robot used by the `cmdloop` binary.
//!
//! Two mechanisms, an elevator and an intake, each with a default command.
//! A periodic task simulates a beam-break sensor that trips after the intake
//! has run for a while. A trigger on that sensor drives the cycle:
//! - falling edge (no game piece, including the very first poll): run the
//!   intake until a piece is detected
//! - rising edge (piece acquired): raise the elevator and eject
//!
//! The elevator's default command brings it back down whenever nothing else
//! needs it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::command::{Command, Mechanism};
use crate::coroutine::Coroutine;
use crate::errors::Result;
use crate::scheduler::Scheduler;
use crate::trigger::Trigger;
use crate::types::DebounceKind;

/// Elevator height at which a piece can be scored.
pub const SCORING_HEIGHT: u32 = 100;
/// Elevator travel per tick while moving.
pub const ELEVATOR_STEP: u32 = 20;
/// Ticks of intake running before the sensor sees a piece.
pub const INTAKE_TICKS_PER_PIECE: u32 = 10;

/// Simulated hardware state shared by all command bodies.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RobotState {
    pub elevator_height: u32,
    pub intake_running: bool,
    pub intake_ticks: u32,
    pub has_piece: bool,
    pub pieces_scored: u32,
}

pub struct Robot {
    pub elevator: Mechanism,
    pub intake: Mechanism,
    pub state: Arc<Mutex<RobotState>>,
    pub intake_piece: Command,
    pub score: Command,
    pub piece_sensor: Trigger,
}

impl Robot {
    /// Create the mechanisms and commands and wire them into `scheduler`.
    pub fn install(scheduler: &Scheduler) -> Result<Self> {
        let elevator = Mechanism::new("Elevator");
        let intake = Mechanism::new("Intake");
        let state = Arc::new(Mutex::new(RobotState::default()));

        scheduler.set_default_command(&elevator, home_elevator(&elevator, &state))?;
        scheduler.set_default_command(&intake, stop_intake(&intake, &state))?;

        // Beam-break sensor.
        {
            let state = state.clone();
            scheduler.add_periodic(move || {
                let mut s = state.lock();
                if s.intake_running && !s.has_piece {
                    s.intake_ticks += 1;
                    if s.intake_ticks >= INTAKE_TICKS_PER_PIECE {
                        s.has_piece = true;
                        s.intake_ticks = 0;
                    }
                }
            });
        }

        let intake_piece = run_intake(&intake, &state);
        let score = Command::sequence(
            "Score",
            [
                move_elevator("Raise Elevator", &elevator, &state, SCORING_HEIGHT),
                eject(&intake, &state),
            ],
        )
        .with_priority(1);

        let sensor_state = state.clone();
        let piece_sensor = Trigger::new(scheduler, move || sensor_state.lock().has_piece)
            .debounce(Duration::from_millis(40), DebounceKind::Rising);
        piece_sensor.on_false(intake_piece.clone());
        piece_sensor.on_true(score.clone());

        Ok(Self {
            elevator,
            intake,
            state,
            intake_piece,
            score,
            piece_sensor,
        })
    }

    pub fn snapshot(&self) -> RobotState {
        self.state.lock().clone()
    }
}

fn home_elevator(elevator: &Mechanism, state: &Arc<Mutex<RobotState>>) -> Command {
    let state = state.clone();
    Command::new("Home Elevator", [elevator.clone()], move |co: &Coroutine| -> anyhow::Result<()> {
        while !step_toward(&state, 0) {
            co.yield_now();
        }
        co.park()
    })
}

fn stop_intake(intake: &Mechanism, state: &Arc<Mutex<RobotState>>) -> Command {
    let state = state.clone();
    Command::new("Stop Intake", [intake.clone()], move |co: &Coroutine| -> anyhow::Result<()> {
        state.lock().intake_running = false;
        co.park()
    })
}

fn run_intake(intake: &Mechanism, state: &Arc<Mutex<RobotState>>) -> Command {
    let state = state.clone();
    let stop_state = state.clone();
    Command::new("Run Intake", [intake.clone()], move |co: &Coroutine| {
        state.lock().intake_running = true;
        co.wait_until(|| state.lock().has_piece);
        state.lock().intake_running = false;
        Ok(())
    })
    .when_canceled(move || stop_state.lock().intake_running = false)
}

fn move_elevator(
    name: &str,
    elevator: &Mechanism,
    state: &Arc<Mutex<RobotState>>,
    target: u32,
) -> Command {
    let state = state.clone();
    Command::new(name, [elevator.clone()], move |co: &Coroutine| {
        while !step_toward(&state, target) {
            co.yield_now();
        }
        Ok(())
    })
}

/// Move the elevator one step toward `target`; true once it is there.
fn step_toward(state: &Mutex<RobotState>, target: u32) -> bool {
    let mut s = state.lock();
    if s.elevator_height == target {
        return true;
    }
    s.elevator_height = if s.elevator_height < target {
        (s.elevator_height + ELEVATOR_STEP).min(target)
    } else {
        s.elevator_height.saturating_sub(ELEVATOR_STEP).max(target)
    };
    false
}

fn eject(intake: &Mechanism, state: &Arc<Mutex<RobotState>>) -> Command {
    let state = state.clone();
    Command::new("Eject", [intake.clone()], move |co: &Coroutine| {
        state.lock().intake_running = true;
        co.wait(Duration::from_millis(100));
        let mut s = state.lock();
        s.intake_running = false;
        s.has_piece = false;
        s.pieces_scored += 1;
        info!(scored = s.pieces_scored, "piece scored");
        Ok(())
    })
}
