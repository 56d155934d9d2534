// src/core/clock.rs

//! A process-local monotonic millisecond clock, cheap enough to be stored in
//! atomics for last-activity bookkeeping.

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed since the first call into the clock.
pub fn now_millis() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

/// The time elapsed since a timestamp taken from [`now_millis`].
pub fn since(millis: u64) -> Duration {
    Duration::from_millis(now_millis().saturating_sub(millis))
}
