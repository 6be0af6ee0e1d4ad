//! Helpers for data sizes and transfer timing.

/// One kilobyte, in bytes.
pub const KB: u64 = 1_000;

/// One megabyte, in bytes.
pub const MB: u64 = 1_000_000;

/// One gigabyte, in bytes.
pub const GB: u64 = 1_000_000_000;

/// Computes the simulated duration, in seconds, of transferring `bytes`
/// over a channel with the given bandwidth in bytes per second.
///
/// A zero-byte transfer takes no time.
///
/// # Panics
///
/// Panics if the bandwidth is not a positive, finite number.
pub fn transfer_duration(bytes: u64, bandwidth: f64) -> f64 {
    assert!(
        bandwidth.is_finite() && bandwidth > 0.0,
        "transfer bandwidth must be positive"
    );

    bytes as f64 / bandwidth
}
