use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use cmdloop::{Command, Coroutine, Mechanism, ScheduleResult};
use cmdloop_test_utils::builders::{Counter, counting_steps, parked};
use cmdloop_test_utils::{EventRecorder, manual_scheduler, running_names, tick_n};

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn scheduled_command_is_mounted_on_the_next_tick() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let arm = Mechanism::new("Arm");
    let hold = parked("Hold", &[&arm]);

    assert_eq!(scheduler.schedule(&hold)?, ScheduleResult::Success);
    assert!(scheduler.is_scheduled(&hold));
    assert!(!scheduler.is_running(&hold));

    scheduler.tick()?;

    assert!(scheduler.is_running(&hold));
    assert!(!scheduler.is_scheduled(&hold));
    assert_eq!(scheduler.running_commands_for(&arm), vec![hold.clone()]);
    assert_eq!(scheduler.schedule(&hold)?, ScheduleResult::AlreadyRunning);
    Ok(())
}

#[test]
fn scheduling_a_queued_command_twice_is_rejected() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let hold = parked("Hold", &[]);

    assert_eq!(scheduler.schedule(&hold)?, ScheduleResult::Success);
    assert_eq!(scheduler.schedule(&hold)?, ScheduleResult::AlreadyRunning);
    assert_eq!(scheduler.queued_commands().len(), 1);
    Ok(())
}

#[test]
fn command_runs_one_step_per_tick_until_it_returns() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let counter = Counter::new();
    let cmd = counting_steps("Count", &[], &counter, 3);
    let events = EventRecorder::attach(&scheduler);

    scheduler.schedule(&cmd)?;
    for expected in 1..=3 {
        scheduler.tick()?;
        assert_eq!(counter.get(), expected);
        assert!(scheduler.is_running(&cmd));
    }

    scheduler.tick()?;
    assert_eq!(counter.get(), 3);
    assert!(!scheduler.is_scheduled_or_running(&cmd));
    assert_eq!(
        events.labels_for("Count"),
        ["scheduled", "mounted", "yielded", "yielded", "yielded", "completed"]
    );
    Ok(())
}

#[test]
fn bodies_never_interleave() -> TestResult {
    const COMMANDS: usize = 100;
    const STEPS: usize = 500;

    let (scheduler, _clock) = manual_scheduler();
    let counter = Arc::new(AtomicUsize::new(0));

    for i in 0..COMMANDS {
        let counter = counter.clone();
        let cmd = Command::no_requirements(format!("Increment {i}"), move |co: &Coroutine| {
            for _ in 0..STEPS {
                // Unsynchronized read-modify-write; only exclusive execution
                // keeps it exact.
                let seen = counter.load(Ordering::Relaxed);
                std::thread::yield_now();
                counter.store(seen + 1, Ordering::Relaxed);
                co.yield_now();
            }
            Ok(())
        });
        scheduler.schedule(&cmd)?;
    }

    tick_n(&scheduler, STEPS)?;

    assert_eq!(counter.load(Ordering::Relaxed), COMMANDS * STEPS);
    Ok(())
}

#[test]
fn rescheduling_a_finished_command_starts_a_fresh_run() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));
    let cmd = {
        let log = log.clone();
        Command::no_requirements("Twice", move |co: &Coroutine| {
            for step in 0..2 {
                log.lock().push(step);
                co.yield_now();
            }
            Ok(())
        })
    };

    scheduler.schedule(&cmd)?;
    scheduler.tick()?;
    let first_run = scheduler.run_id(&cmd);
    tick_n(&scheduler, 2)?;
    assert!(!scheduler.is_running(&cmd));

    scheduler.schedule(&cmd)?;
    tick_n(&scheduler, 3)?;

    assert_eq!(*log.lock(), [0, 1, 0, 1]);
    assert!(first_run.is_some());
    assert!(!scheduler.is_running(&cmd));

    scheduler.schedule(&cmd)?;
    scheduler.tick()?;
    assert_ne!(scheduler.run_id(&cmd), first_run);
    Ok(())
}

#[test]
fn unrelated_commands_resume_in_mount_order() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));
    let logger = |name: &'static str| {
        let log = log.clone();
        Command::no_requirements(name, move |co: &Coroutine| -> anyhow::Result<()> {
            loop {
                log.lock().push(name);
                co.yield_now();
            }
        })
    };
    let first = logger("First");
    let second = logger("Second");

    scheduler.schedule(&first)?;
    scheduler.schedule(&second)?;
    tick_n(&scheduler, 2)?;

    assert_eq!(*log.lock(), ["First", "Second", "First", "Second"]);
    assert_eq!(running_names(&scheduler), ["First", "Second"]);
    Ok(())
}

#[test]
fn children_resume_before_their_parent() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));
    let child = {
        let log = log.clone();
        Command::no_requirements("Child", move |co: &Coroutine| -> anyhow::Result<()> {
            loop {
                log.lock().push("Child");
                co.yield_now();
            }
        })
    };
    let parent = {
        let log = log.clone();
        let child = child.clone();
        Command::no_requirements("Parent", move |co: &Coroutine| -> anyhow::Result<()> {
            co.fork([&child])?;
            loop {
                log.lock().push("Parent");
                co.yield_now();
            }
        })
    };

    scheduler.schedule(&parent)?;
    scheduler.tick()?;
    // First tick: the fork runs the child inline, before the parent goes on.
    assert_eq!(*log.lock(), ["Child", "Parent"]);

    log.lock().clear();
    scheduler.tick()?;
    assert_eq!(*log.lock(), ["Child", "Parent"]);
    assert_eq!(scheduler.parent_of(&child), Some(parent.clone()));
    assert_eq!(scheduler.parent_of(&parent), None);
    Ok(())
}

#[test]
fn current_command_is_visible_from_inside_a_body() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let seen = Arc::new(Mutex::new(None));
    let cmd = {
        let seen = seen.clone();
        Command::no_requirements("Observer", move |co: &Coroutine| {
            *seen.lock() = co.scheduler().current_command();
            assert_eq!(co.command().map(Command::name), Some("Observer"));
            Ok(())
        })
    };

    scheduler.schedule(&cmd)?;
    scheduler.tick()?;

    assert_eq!(seen.lock().as_ref().map(Command::name), Some("Observer"));
    assert_eq!(scheduler.current_command(), None);
    Ok(())
}

#[test]
fn canceling_a_running_command_frees_its_mechanism() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let arm = Mechanism::new("Arm");
    let hold = parked("Hold", &[&arm]);
    let events = EventRecorder::attach(&scheduler);

    scheduler.schedule(&hold)?;
    scheduler.tick()?;
    scheduler.cancel(&hold)?;

    assert!(!scheduler.is_running(&hold));
    assert!(scheduler.running_commands_for(&arm).is_empty());
    assert_eq!(events.count("Hold", "canceled"), 1);

    // Canceling again is a no-op.
    scheduler.cancel(&hold)?;
    assert_eq!(events.count("Hold", "canceled"), 1);
    Ok(())
}

#[test]
fn cancel_all_clears_queue_and_mount_table() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let running = parked("Running", &[]);
    let queued = parked("Queued", &[]);

    scheduler.schedule(&running)?;
    scheduler.tick()?;
    scheduler.schedule(&queued)?;
    scheduler.cancel_all()?;

    assert!(scheduler.running_commands().is_empty());
    assert!(scheduler.queued_commands().is_empty());
    scheduler.tick()?;
    assert!(scheduler.running_commands().is_empty());
    Ok(())
}

#[test]
fn independent_schedulers_do_not_share_state() -> TestResult {
    let (first, _c1) = manual_scheduler();
    let (second, _c2) = manual_scheduler();
    let hold = parked("Hold", &[]);

    first.schedule(&hold)?;
    first.tick()?;
    second.tick()?;

    assert!(first.is_running(&hold));
    assert!(!second.is_running(&hold));
    assert_eq!(first.tick_count(), 1);
    assert_eq!(second.tick_count(), 1);
    Ok(())
}

#[test]
fn snapshot_lists_queued_and_running_commands() -> TestResult {
    let (scheduler, _clock) = manual_scheduler();
    let arm = Mechanism::new("Arm");
    let hold = parked("Hold", &[&arm]).with_priority(3);
    let waiting = parked("Waiting", &[]);

    scheduler.schedule(&hold)?;
    scheduler.tick()?;
    scheduler.schedule(&waiting)?;

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.tick, 1);
    assert!(!snapshot.is_idle());
    assert_eq!(snapshot.running_names(), ["Hold"]);
    assert_eq!(snapshot.running[0].priority, 3);
    assert_eq!(snapshot.running[0].requirements, ["Arm"]);
    assert!(snapshot.running[0].run_id.is_some());
    assert_eq!(snapshot.queued.len(), 1);
    assert_eq!(snapshot.queued[0].name, "Waiting");
    assert_eq!(snapshot.queued[0].run_id, None);

    let rendered = toml::to_string_pretty(&snapshot)?;
    assert!(rendered.contains("Hold"));
    Ok(())
}
