//! Implementation of the simulated clock.

use std::time::Duration;

use tokio::time::Instant;

/// A clock reporting simulated time as seconds since the start of the
/// simulation.
///
/// The clock anchors itself to the tokio clock at construction; every
/// service of a simulation shares one clone so that all of them agree on
/// date zero.
#[derive(Debug, Clone)]
pub struct SimClock {
    /// The instant corresponding to simulated date zero.
    origin: Instant,
}

impl SimClock {
    /// Creates a new clock with the current instant as date zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Gets the current simulated date, in seconds since date zero.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Suspends the calling process for the given number of simulated
    /// seconds.
    ///
    /// Non-positive and non-finite durations return immediately.
    pub async fn sleep(&self, seconds: f64) {
        if seconds > 0.0 && seconds.is_finite() {
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        }
    }

    /// Suspends the calling process until the given simulated date.
    ///
    /// Returns immediately if the date is in the past.
    pub async fn sleep_until(&self, date: f64) {
        let remaining = date - self.now();
        self.sleep(remaining).await;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}
