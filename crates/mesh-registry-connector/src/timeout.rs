//! Adaptive per-listener request timeout.
//!
//! Starts at the minimum, expands multiplicatively on failure up to the
//! maximum; a success re-arms the next timeout from the observed delay so
//! the client adapts quickly without starving slow servers.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TimeoutStrategy {
    min_ms: u64,
    max_ms: u64,
    expand: f64,
    current_ms: u64,
}

impl TimeoutStrategy {
    pub fn new(min_ms: u64, max_ms: u64, expand: f64) -> Self {
        let min_ms = min_ms.max(1);
        let max_ms = max_ms.max(min_ms);
        Self {
            min_ms,
            max_ms,
            expand: if expand > 1.0 { expand } else { 2.0 },
            current_ms: min_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.current_ms
    }

    /// Failure path: expand toward the maximum.
    pub fn on_retry(&mut self) {
        self.current_ms = ((self.current_ms as f64 * self.expand) as u64).min(self.max_ms);
    }

    /// Success path: next timeout tracks the observed delay, clamped.
    pub fn on_success(&mut self, observed_ms: u64) {
        let next = (observed_ms as f64 * self.expand) as u64;
        self.current_ms = next.clamp(self.min_ms, self.max_ms);
    }
}
