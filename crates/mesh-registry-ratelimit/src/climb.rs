//! Adaptive quota tuning.
//!
//! Samples call outcomes over the rule-provided interval and nudges the
//! effective ceiling inside `[min_amount, max_amount]`: down when the
//! error or slow rate crosses its threshold, back up while the window
//! stays healthy.

use mesh_registry_core::model::rules::ClimbConfig;

const TUNE_DOWN: f64 = 0.7;
const TUNE_UP: f64 = 1.2;

/// Multiplier the window applies to each bucket's base amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimbFactor {
    ratio: f64,
    min_amount: u64,
    max_amount: u64,
}

impl ClimbFactor {
    pub fn apply(&self, base: u64) -> u64 {
        let scaled = (base as f64 * self.ratio).round() as u64;
        scaled.clamp(self.min_amount, self.max_amount)
    }
}

#[derive(Debug)]
pub struct ClimbState {
    config: ClimbConfig,
    ratio: f64,
    total: u64,
    errors: u64,
    slow: u64,
    last_sample_ms: u64,
}

impl ClimbState {
    pub fn new(config: ClimbConfig) -> Self {
        Self {
            config,
            ratio: 1.0,
            total: 0,
            errors: 0,
            slow: 0,
            last_sample_ms: 0,
        }
    }

    pub fn record(&mut self, success: bool, latency_ms: u64) {
        self.total += 1;
        if !success {
            self.errors += 1;
        }
        if latency_ms >= self.config.slow_call_ms {
            self.slow += 1;
        }
    }

    /// Closes the sample period when due and returns the new factor, if
    /// the ratio moved.
    pub fn maybe_adjust(&mut self, now_ms: u64) -> Option<ClimbFactor> {
        if self.last_sample_ms == 0 {
            self.last_sample_ms = now_ms;
            return None;
        }
        if now_ms.saturating_sub(self.last_sample_ms) < self.config.sample_interval_ms {
            return None;
        }
        self.last_sample_ms = now_ms;
        if self.total == 0 {
            return None;
        }
        let error_rate = self.errors as f64 / self.total as f64;
        let slow_rate = self.slow as f64 / self.total as f64;
        self.total = 0;
        self.errors = 0;
        self.slow = 0;

        let previous = self.ratio;
        if error_rate >= self.config.error_rate || slow_rate >= self.config.slow_rate {
            self.ratio = (self.ratio * TUNE_DOWN).max(0.01);
        } else {
            self.ratio = (self.ratio * TUNE_UP).min(1.0);
        }
        if (self.ratio - previous).abs() < f64::EPSILON {
            return None;
        }
        Some(ClimbFactor {
            ratio: self.ratio,
            min_amount: self.config.min_amount,
            max_amount: self.config.max_amount,
        })
    }
}
