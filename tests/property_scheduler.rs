use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use cmdloop::{Command, Coroutine, Mechanism, ScheduleResult};
use cmdloop_test_utils::builders::parked;
use cmdloop_test_utils::{manual_scheduler, tick_n};

#[derive(Debug, Clone)]
enum Op {
    /// Schedule a fresh parked command on the mechanisms picked by `mask`.
    Schedule { mask: u8, priority: i32 },
    Tick,
    CancelOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u8..8, 0i32..3).prop_map(|(mask, priority)| Op::Schedule { mask, priority }),
        2 => Just(Op::Tick),
        1 => Just(Op::CancelOldest),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn shared_counter_is_exact_for_any_population(commands in 1usize..16, steps in 1usize..24) {
        let (scheduler, _clock) = manual_scheduler();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..commands {
            let counter = counter.clone();
            let cmd = Command::no_requirements(format!("Increment {i}"), move |co: &Coroutine| {
                for _ in 0..steps {
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                    co.yield_now();
                }
                Ok(())
            });
            scheduler.schedule(&cmd).unwrap();
        }
        tick_n(&scheduler, steps).unwrap();

        prop_assert_eq!(counter.load(Ordering::Relaxed), commands * steps);
    }

    #[test]
    fn each_mechanism_has_at_most_one_claimant(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (scheduler, _clock) = manual_scheduler();
        let mechanisms = [Mechanism::new("A"), Mechanism::new("B"), Mechanism::new("C")];

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Schedule { mask, priority } => {
                    let requirements: Vec<&Mechanism> = mechanisms
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| mask & (1 << i) != 0)
                        .map(|(_, m)| m)
                        .collect();
                    let cmd = parked(&format!("Cmd {n}"), &requirements).with_priority(priority);
                    if scheduler.schedule(&cmd).unwrap() == ScheduleResult::LowerPriorityThanRunningCommand {
                        let blocked = scheduler
                            .running_commands()
                            .iter()
                            .chain(scheduler.queued_commands().iter())
                            .any(|other| other.conflicts_with(&cmd) && cmd.is_lower_priority_than(other));
                        prop_assert!(blocked);
                    }
                }
                Op::Tick => scheduler.tick().unwrap(),
                Op::CancelOldest => {
                    if let Some(oldest) = scheduler.running_commands().first() {
                        scheduler.cancel(oldest).unwrap();
                    }
                }
            }

            for mechanism in &mechanisms {
                prop_assert!(scheduler.running_commands_for(mechanism).len() <= 1);
            }
        }
    }
}
