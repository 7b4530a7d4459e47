// src/engine/mod.rs

//! Drivers that call [`Scheduler::tick`](crate::scheduler::Scheduler::tick)
//! on a schedule.
//!
//! The scheduler itself is synchronous and knows nothing about time beyond
//! its injected clock. The async shell in [`tick_loop`] owns the period,
//! the tick budget and shutdown handling.

pub mod tick_loop;

pub use tick_loop::{StopReason, TickLoop, TickReport};
