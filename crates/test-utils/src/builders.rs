use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use cmdloop::{Command, Coroutine, Mechanism};

/// Shared counter handed to command bodies.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn owned(requirements: &[&Mechanism]) -> Vec<Mechanism> {
    requirements.iter().map(|m| (*m).clone()).collect()
}

/// A command that claims `requirements` and never finishes.
pub fn parked(name: &str, requirements: &[&Mechanism]) -> Command {
    Command::idle(name, owned(requirements))
}

/// A command that bumps `counter` once per step, forever.
pub fn counting_forever(name: &str, requirements: &[&Mechanism], counter: &Counter) -> Command {
    let counter = counter.clone();
    Command::new(name, owned(requirements), move |co: &Coroutine| -> anyhow::Result<()> {
        loop {
            counter.bump();
            co.yield_now();
        }
    })
}

/// A command that bumps `counter`, then yields, `steps` times, then returns.
///
/// It is mounted for `steps` ticks and completes on the tick after its
/// last bump.
pub fn counting_steps(
    name: &str,
    requirements: &[&Mechanism],
    counter: &Counter,
    steps: usize,
) -> Command {
    let counter = counter.clone();
    Command::new(name, owned(requirements), move |co: &Coroutine| {
        for _ in 0..steps {
            counter.bump();
            co.yield_now();
        }
        Ok(())
    })
}

/// A command that bumps `counter` and returns in its first step.
pub fn instant(name: &str, requirements: &[&Mechanism], counter: &Counter) -> Command {
    let counter = counter.clone();
    Command::new(name, owned(requirements), move |_: &Coroutine| {
        counter.bump();
        Ok(())
    })
}

/// A command that fails after `yields` suspensions.
pub fn failing_after(name: &str, requirements: &[&Mechanism], yields: usize, message: &str) -> Command {
    let message = message.to_string();
    Command::new(name, owned(requirements), move |co: &Coroutine| {
        for _ in 0..yields {
            co.yield_now();
        }
        Err(anyhow!("{message}"))
    })
}
