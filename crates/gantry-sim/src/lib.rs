//! Simulation substrate for the Gantry scheduling simulator.
//!
//! This crate is the thin facade between the scheduling engines and the
//! machinery that advances simulated time. It deliberately implements no
//! scheduling semantics of its own: it provides a simulated clock with a
//! cooperative `sleep`, descriptors for the compute platform a service
//! manages, killable alarms that post a message to a port at a future date,
//! and helpers for converting data sizes into transfer durations.
//!
//! Simulations are expected to run on a current-thread tokio runtime with
//! time paused (`start_paused = true` in tests). Under paused time, every
//! sleep completes instantly once all tasks are suspended, which yields a
//! deterministic, single-threaded cooperative execution: a process runs
//! until it blocks on a channel or a sleep, and simulated time advances only
//! while everything is blocked.

mod alarm;
mod clock;
mod platform;
mod units;

pub use alarm::*;
pub use clock::*;
pub use platform::*;
pub use units::*;
