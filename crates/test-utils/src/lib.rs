pub mod builders;
pub mod recorder;

use std::sync::{Arc, Once};

use cmdloop::errors::Result;
use cmdloop::{ManualClock, Scheduler};
use tracing_subscriber::{EnvFilter, fmt};

pub use recorder::EventRecorder;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=cmdloop=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .with_thread_names(true)
            .init();
    });
}

/// A scheduler on a fake clock, plus a handle to drive the clock.
pub fn manual_scheduler() -> (Scheduler, ManualClock) {
    init_tracing();
    let clock = ManualClock::new();
    let scheduler = Scheduler::with_clock(Arc::new(clock.clone()));
    (scheduler, clock)
}

/// Tick `n` times, stopping at the first aborted tick.
pub fn tick_n(scheduler: &Scheduler, n: usize) -> Result<()> {
    for _ in 0..n {
        scheduler.tick()?;
    }
    Ok(())
}

/// Names of the running commands, in mount order.
pub fn running_names(scheduler: &Scheduler) -> Vec<String> {
    scheduler
        .running_commands()
        .iter()
        .map(|c| c.name().to_string())
        .collect()
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}
