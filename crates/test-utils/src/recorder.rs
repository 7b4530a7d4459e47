use std::sync::Arc;

use cmdloop::{EventKind, Scheduler, SchedulerEvent};
use parking_lot::Mutex;

/// Listener that keeps every lifecycle event for later assertions.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
}

impl EventRecorder {
    /// Create a recorder and register it on `scheduler`.
    pub fn attach(scheduler: &Scheduler) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        scheduler.add_event_listener(move |event| sink.lock().push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Event labels for commands named `name`, in order.
    pub fn labels_for(&self, name: &str) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.command.name() == name)
            .map(|e| e.kind.label())
            .collect()
    }

    /// `"<command> <label>"` for every event except yields.
    pub fn transitions(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| !matches!(e.kind, EventKind::Yielded))
            .map(|e| format!("{} {}", e.command.name(), e.kind.label()))
            .collect()
    }

    pub fn count(&self, name: &str, label: &str) -> usize {
        self.labels_for(name).iter().filter(|l| **l == label).count()
    }

    /// Error text of the first `Failed` event for `name`.
    pub fn failure_of(&self, name: &str) -> Option<String> {
        self.events.lock().iter().find_map(|e| match &e.kind {
            EventKind::Failed { error } if e.command.name() == name => Some(error.clone()),
            _ => None,
        })
    }
}
