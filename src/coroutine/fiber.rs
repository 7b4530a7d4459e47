// src/coroutine/fiber.rs

//! Thread-backed stackful execution contexts with a strict handoff.
//!
//! Each [`Fiber`] owns one OS thread that runs a body to completion. The
//! thread and its resumer talk over two rendezvous channels (capacity 0):
//!
//! ```text
//! resumer                     fiber thread
//! ───────                     ────────────
//! resume_tx.send(())  ──────▶ resume_rx.recv()   body runs
//! step_rx.recv()      ◀────── step_tx.send(Suspended | Finished)
//! ```
//!
//! The resumer is blocked for the whole step, so at most one of the two
//! sides executes user code at any instant. Dropping a suspended fiber closes
//! its resume channel; the thread then unwinds its stack (running
//! destructors) and exits, and the drop joins it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use tracing::trace;

use crate::errors::{CmdloopError, Result};

/// What a fiber did with the step it was given.
#[derive(Debug)]
pub(crate) enum Step {
    Suspended,
    Finished(anyhow::Result<()>),
}

/// Unwind payload used to tear down a fiber that will never be resumed.
struct Unwound;

pub(crate) struct Fiber {
    name: String,
    resume_tx: Option<SyncSender<()>>,
    step_rx: Receiver<Step>,
    thread: Option<JoinHandle<()>>,
    finished: bool,
}

/// The fiber-side half of the handoff, owned by the running body.
pub(crate) struct Suspender {
    resume_rx: Receiver<()>,
    step_tx: SyncSender<Step>,
}

impl Fiber {
    /// Spawn the thread. The body does not start until the first
    /// [`resume`](Fiber::resume).
    pub(crate) fn spawn<F>(name: String, stack_size: usize, body: F) -> Result<Self>
    where
        F: FnOnce(Suspender) -> anyhow::Result<()> + Send + 'static,
    {
        let (resume_tx, resume_rx) = sync_channel::<()>(0);
        let (step_tx, step_rx) = sync_channel::<Step>(0);

        let thread = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || {
                if resume_rx.recv().is_err() {
                    return;
                }
                let done_tx = step_tx.clone();
                let suspender = Suspender {
                    resume_rx,
                    step_tx,
                };
                let result = match panic::catch_unwind(AssertUnwindSafe(move || body(suspender))) {
                    Ok(result) => result,
                    Err(payload) if payload.is::<Unwound>() => return,
                    Err(payload) => Err(anyhow!(
                        "command body panicked: {}",
                        panic_message(payload.as_ref())
                    )),
                };
                let _ = done_tx.send(Step::Finished(result));
            })
            .map_err(CmdloopError::ContextSpawn)?;

        Ok(Self {
            name,
            resume_tx: Some(resume_tx),
            step_rx,
            thread: Some(thread),
            finished: false,
        })
    }

    /// Run the body until its next suspension point or until it returns.
    ///
    /// Blocks the calling thread for the duration of the step.
    pub(crate) fn resume(&mut self) -> Step {
        if self.finished {
            return Step::Finished(Err(anyhow!("fiber `{}` already finished", self.name)));
        }
        let sent = self
            .resume_tx
            .as_ref()
            .is_some_and(|tx| tx.send(()).is_ok());
        if !sent {
            self.finished = true;
            return Step::Finished(Err(anyhow!("fiber `{}` is gone", self.name)));
        }
        match self.step_rx.recv() {
            Ok(Step::Suspended) => Step::Suspended,
            Ok(finished) => {
                self.finished = true;
                finished
            }
            Err(_) => {
                self.finished = true;
                Step::Finished(Err(anyhow!("fiber `{}` exited without reporting", self.name)))
            }
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // Closing the channel makes a suspended body unwind.
        self.resume_tx.take();
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                trace!(fiber = %self.name, "fiber thread ended abnormally");
            }
        }
    }
}

impl Suspender {
    /// Hand control back to the resumer and block until resumed again.
    ///
    /// Never returns if the fiber is dropped while suspended.
    pub(crate) fn suspend(&self) {
        if self.step_tx.send(Step::Suspended).is_err() {
            unwind();
        }
        if self.resume_rx.recv().is_err() {
            unwind();
        }
    }
}

/// Abandon the current fiber's stack.
pub(crate) fn unwind() -> ! {
    panic::resume_unwind(Box::new(Unwound))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STACK: usize = 128 * 1024;

    #[test]
    fn body_runs_only_while_resumed() {
        let steps = Arc::new(AtomicUsize::new(0));
        let seen = steps.clone();
        let mut fiber = Fiber::spawn("t".into(), STACK, move |s| {
            for _ in 0..3 {
                seen.fetch_add(1, Ordering::SeqCst);
                s.suspend();
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(steps.load(Ordering::SeqCst), 0);
        for expected in 1..=3 {
            assert!(matches!(fiber.resume(), Step::Suspended));
            assert_eq!(steps.load(Ordering::SeqCst), expected);
        }
        assert!(matches!(fiber.resume(), Step::Finished(Ok(()))));
        assert!(matches!(fiber.resume(), Step::Finished(Err(_))));
    }

    #[test]
    fn errors_and_panics_are_reported_as_finished() {
        let mut failing = Fiber::spawn("f".into(), STACK, |_| Err(anyhow!("boom"))).unwrap();
        match failing.resume() {
            Step::Finished(Err(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected step: {other:?}"),
        }

        let mut panicking = Fiber::spawn("p".into(), STACK, |_| panic!("kaboom")).unwrap();
        match panicking.resume() {
            Step::Finished(Err(e)) => assert!(e.to_string().contains("kaboom")),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn dropping_a_suspended_fiber_runs_destructors() {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = Flag(dropped.clone());
        let mut fiber = Fiber::spawn("d".into(), STACK, move |s| {
            let _flag = flag;
            loop {
                s.suspend();
            }
        })
        .unwrap();

        assert!(matches!(fiber.resume(), Step::Suspended));
        drop(fiber);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_resumed_fiber_drops_cleanly() {
        let fiber = Fiber::spawn("n".into(), STACK, |_| Ok(())).unwrap();
        drop(fiber);
    }
}
