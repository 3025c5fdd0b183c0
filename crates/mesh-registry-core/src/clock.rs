//! Monotonic millisecond clock with an optional coarse cached tick.
//!
//! All timing in the client is expressed as milliseconds since the process
//! epoch. The reactor refreshes [`coarse_now_ms`] roughly once per
//! millisecond so hot paths can read a cached value instead of taking a
//! syscall-backed `Instant` every time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

static COARSE_MS: AtomicU64 = AtomicU64::new(0);

/// Precise monotonic milliseconds since the process epoch.
pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Cached monotonic milliseconds, refreshed by the reactor tick. Falls back
/// to a precise read until the first tick has happened.
pub fn coarse_now_ms() -> u64 {
    let cached = COARSE_MS.load(Ordering::Relaxed);
    if cached == 0 {
        now_ms()
    } else {
        cached
    }
}

/// Refreshes the coarse tick. Called by the reactor loop; monotonicity is
/// preserved even if ticks race because stale stores lose the max.
pub fn tick() -> u64 {
    let now = now_ms();
    COARSE_MS.fetch_max(now, Ordering::Relaxed);
    now
}
