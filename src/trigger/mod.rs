// src/trigger/mod.rs

//! Edge-triggered bindings from boolean signals to commands.
//!
//! A [`Trigger`] samples its probe once per tick. The previous sample starts
//! out `true`, so a probe that reads `false` on the very first poll produces a
//! falling edge.
//!
//! On a rising edge:
//! - `on_true` and `while_true` commands are scheduled
//! - `while_false` commands are canceled
//! - `toggle_on_true` commands are canceled if queued or running, scheduled
//!   otherwise
//!
//! A falling edge does the mirror image.
//!
//! A binding created from inside a running command body is scoped to that
//! command: its command is mounted as a child of the scope, and once the
//! scope ends the binding is dropped and its command canceled.

mod debounce;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::duration_to_micros;
use crate::command::Command;
use crate::errors::Result;
use crate::scheduler::{RunId, Scheduler};
use crate::types::DebounceKind;

use debounce::Debouncer;

type Probe = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    OnTrue,
    OnFalse,
    WhileTrue,
    WhileFalse,
    ToggleOnTrue,
    ToggleOnFalse,
}

#[derive(Clone)]
struct Binding {
    kind: BindingKind,
    command: Command,
    /// Execution the binding belongs to; `None` for a global binding.
    scope: Option<RunId>,
}

pub(crate) struct TriggerCore {
    probe: Probe,
    /// Sample from the poll before last.
    previous: AtomicBool,
    /// Sample from the last poll.
    current: AtomicBool,
    bindings: Mutex<Vec<Binding>>,
    registered: AtomicBool,
    /// Triggers this one is derived from; they are polled first.
    dependencies: Vec<Arc<TriggerCore>>,
}

impl TriggerCore {
    fn new(probe: Probe, dependencies: Vec<Arc<TriggerCore>>) -> Self {
        Self {
            probe,
            previous: AtomicBool::new(true),
            current: AtomicBool::new(true),
            bindings: Mutex::new(Vec::new()),
            registered: AtomicBool::new(false),
            dependencies,
        }
    }

    fn ensure_registered(self: &Arc<Self>, scheduler: &Scheduler) {
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }
        for dependency in &self.dependencies {
            dependency.ensure_registered(scheduler);
        }
        scheduler.register_trigger(self.clone());
    }

    /// Sample the probe and fire the bindings for the edge, if any.
    pub(crate) fn poll(&self, scheduler: &Scheduler) -> Result<()> {
        self.clear_stale_bindings(scheduler)?;

        let sample = (self.probe)();
        let last = self.current.swap(sample, Ordering::SeqCst);
        self.previous.store(last, Ordering::SeqCst);
        if sample == last {
            return Ok(());
        }

        let bindings = self.bindings.lock().clone();
        let of = |kind: BindingKind| bindings.iter().filter(move |b| b.kind == kind);

        let (schedule_now, run_while, stop_while, toggle) = if sample {
            (
                BindingKind::OnTrue,
                BindingKind::WhileTrue,
                BindingKind::WhileFalse,
                BindingKind::ToggleOnTrue,
            )
        } else {
            (
                BindingKind::OnFalse,
                BindingKind::WhileFalse,
                BindingKind::WhileTrue,
                BindingKind::ToggleOnFalse,
            )
        };

        for binding in of(schedule_now).chain(of(run_while)) {
            scheduler.schedule_scoped(&binding.command, binding.scope)?;
        }
        for binding in of(stop_while) {
            scheduler.cancel(&binding.command)?;
        }
        for binding in of(toggle) {
            if scheduler.is_scheduled_or_running(&binding.command) {
                scheduler.cancel(&binding.command)?;
            } else {
                scheduler.schedule_scoped(&binding.command, binding.scope)?;
            }
        }
        Ok(())
    }

    fn clear_stale_bindings(&self, scheduler: &Scheduler) -> Result<()> {
        let stale: Vec<Binding> = {
            let mut bindings = self.bindings.lock();
            let (stale, live): (Vec<Binding>, Vec<Binding>) = std::mem::take(&mut *bindings)
                .into_iter()
                .partition(|b| b.scope.is_some_and(|run_id| !scheduler.is_run_live(run_id)));
            *bindings = live;
            stale
        };
        for binding in stale {
            debug!(command = %binding.command, "binding scope ended; dropping binding");
            scheduler.cancel(&binding.command)?;
        }
        Ok(())
    }
}

/// A boolean signal bound to commands.
///
/// Cloning a trigger yields a handle to the same bindings.
#[derive(Clone)]
pub struct Trigger {
    scheduler: Scheduler,
    core: Arc<TriggerCore>,
}

impl Trigger {
    pub fn new<F>(scheduler: &Scheduler, probe: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self::derived(scheduler, Arc::new(probe), Vec::new())
    }

    fn derived(scheduler: &Scheduler, probe: Probe, dependencies: Vec<Arc<TriggerCore>>) -> Self {
        Self {
            scheduler: scheduler.clone(),
            core: Arc::new(TriggerCore::new(probe, dependencies)),
        }
    }

    /// Schedule `command` on every rising edge.
    pub fn on_true(&self, command: Command) -> &Self {
        self.bind(BindingKind::OnTrue, command)
    }

    /// Schedule `command` on every falling edge.
    pub fn on_false(&self, command: Command) -> &Self {
        self.bind(BindingKind::OnFalse, command)
    }

    /// Schedule `command` on a rising edge and cancel it on the next falling
    /// edge.
    pub fn while_true(&self, command: Command) -> &Self {
        self.bind(BindingKind::WhileTrue, command)
    }

    pub fn while_false(&self, command: Command) -> &Self {
        self.bind(BindingKind::WhileFalse, command)
    }

    /// On each rising edge, start `command` if idle, cancel it if it is
    /// queued or running.
    pub fn toggle_on_true(&self, command: Command) -> &Self {
        self.bind(BindingKind::ToggleOnTrue, command)
    }

    pub fn toggle_on_false(&self, command: Command) -> &Self {
        self.bind(BindingKind::ToggleOnFalse, command)
    }

    fn bind(&self, kind: BindingKind, command: Command) -> &Self {
        let scope = self.scheduler.current_run().map(|(run_id, _)| run_id);
        self.core.bindings.lock().push(Binding {
            kind,
            command,
            scope,
        });
        self.core.ensure_registered(&self.scheduler);
        self
    }

    /// True while both triggers are.
    pub fn and(&self, other: &Trigger) -> Trigger {
        let (a, b) = (self.core.probe.clone(), other.core.probe.clone());
        Self::derived(
            &self.scheduler,
            Arc::new(move || a() && b()),
            vec![self.core.clone(), other.core.clone()],
        )
    }

    /// True while either trigger is.
    pub fn or(&self, other: &Trigger) -> Trigger {
        let (a, b) = (self.core.probe.clone(), other.core.probe.clone());
        Self::derived(
            &self.scheduler,
            Arc::new(move || a() || b()),
            vec![self.core.clone(), other.core.clone()],
        )
    }

    pub fn negate(&self) -> Trigger {
        let probe = self.core.probe.clone();
        Self::derived(
            &self.scheduler,
            Arc::new(move || !probe()),
            vec![self.core.clone()],
        )
    }

    /// A trigger that only changes once this one has held its new value for
    /// `window`, measured on the scheduler clock.
    pub fn debounce(&self, window: Duration, kind: DebounceKind) -> Trigger {
        let probe = self.core.probe.clone();
        let clock = self.scheduler.clock();
        let debouncer = Mutex::new(Debouncer::new(
            duration_to_micros(window),
            kind,
            clock.now_micros(),
        ));
        Self::derived(
            &self.scheduler,
            Arc::new(move || debouncer.lock().calculate(probe(), clock.now_micros())),
            vec![self.core.clone()],
        )
    }

    /// True for exactly the poll in which this trigger went from low to high.
    ///
    /// Only meaningful while this trigger is polled, i.e. once it has at least
    /// one binding or a derived trigger has.
    pub fn rising_edge(&self) -> Trigger {
        let core = Arc::downgrade(&self.core);
        Self::derived(
            &self.scheduler,
            Arc::new(move || {
                core.upgrade().is_some_and(|c| {
                    c.current.load(Ordering::SeqCst) && !c.previous.load(Ordering::SeqCst)
                })
            }),
            vec![self.core.clone()],
        )
    }

    /// True for exactly the poll in which this trigger went from high to low.
    pub fn falling_edge(&self) -> Trigger {
        let core = Arc::downgrade(&self.core);
        Self::derived(
            &self.scheduler,
            Arc::new(move || {
                core.upgrade().is_some_and(|c| {
                    !c.current.load(Ordering::SeqCst) && c.previous.load(Ordering::SeqCst)
                })
            }),
            vec![self.core.clone()],
        )
    }

    /// The value seen by the most recent poll (`true` before the first).
    pub fn get(&self) -> bool {
        self.core.current.load(Ordering::SeqCst)
    }

    /// Evaluate the probe right now, without touching edge state.
    pub fn sample(&self) -> bool {
        (self.core.probe)()
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("last", &self.get())
            .field("bindings", &self.core.bindings.lock().len())
            .field("registered", &self.core.registered.load(Ordering::SeqCst))
            .finish()
    }
}
