//! Window-based error-ratio circuit breaker.
//!
//! Call outcomes land in a bucketed ring covering `window_ms`. Once the
//! window holds at least `request_volume_threshold` calls, an error ratio at
//! or above `error_rate_threshold` opens the circuit; a ratio in the
//! preserve band keeps the instance out of new traffic without full
//! ejection, and recovery from that band returns straight to closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use mesh_registry_core::CircuitState;

use crate::chain::ChainData;
use crate::{CircuitBreakerPlugin, InstanceGauge};

#[derive(Debug, Clone)]
pub struct ErrorRateConfig {
    pub window_ms: u64,
    pub num_buckets: usize,
    pub request_volume_threshold: u32,
    /// Ratio at or above which the circuit opens.
    pub error_rate_threshold: f64,
    /// Ratio at or above which (but below the open threshold) the instance
    /// is preserved.
    pub preserve_threshold: f64,
    pub sleep_window_ms: u64,
    pub request_after_half_open: u32,
    pub success_count_to_close: u32,
    pub metric_expired_ms: u64,
}

impl Default for ErrorRateConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            num_buckets: 12,
            request_volume_threshold: 10,
            error_rate_threshold: 0.2,
            preserve_threshold: 0.1,
            sleep_window_ms: 30_000,
            request_after_half_open: 3,
            success_count_to_close: 2,
            metric_expired_ms: 3_600_000,
        }
    }
}

impl ErrorRateConfig {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.window_ms == 0 {
            self.window_ms = defaults.window_ms;
        }
        if self.num_buckets == 0 {
            self.num_buckets = defaults.num_buckets;
        }
        if self.request_volume_threshold == 0 {
            self.request_volume_threshold = defaults.request_volume_threshold;
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            self.error_rate_threshold = defaults.error_rate_threshold;
        }
        if !(0.0..=1.0).contains(&self.preserve_threshold)
            || self.preserve_threshold >= self.error_rate_threshold
        {
            self.preserve_threshold = self.error_rate_threshold / 2.0;
        }
        if self.sleep_window_ms == 0 {
            self.sleep_window_ms = defaults.sleep_window_ms;
        }
        if self.request_after_half_open == 0 {
            self.request_after_half_open = defaults.request_after_half_open;
        }
        if self.success_count_to_close == 0 {
            self.success_count_to_close = defaults.success_count_to_close;
        } else if self.success_count_to_close > self.request_after_half_open {
            self.success_count_to_close = self.request_after_half_open;
        }
        if self.metric_expired_ms == 0 {
            self.metric_expired_ms = defaults.metric_expired_ms;
        }
        self
    }

    fn bucket_width_ms(&self) -> u64 {
        (self.window_ms / self.num_buckets as u64).max(1)
    }

    fn error_count_to_open(&self) -> u32 {
        self.request_after_half_open - self.success_count_to_close + 1
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    start_ms: u64,
    total: u32,
    errors: u32,
}

#[derive(Debug)]
struct RateStatus {
    state: RwLock<CircuitState>,
    buckets: Mutex<Vec<Bucket>>,
    half_open_errors: AtomicU32,
    half_open_successes: AtomicU32,
    last_update_ms: AtomicU64,
    last_access_ms: AtomicU64,
}

impl RateStatus {
    fn new(num_buckets: usize, now_ms: u64) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            buckets: Mutex::new(vec![Bucket::default(); num_buckets]),
            half_open_errors: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            last_update_ms: AtomicU64::new(0),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    fn record(&self, config: &ErrorRateConfig, now_ms: u64, failure: bool) {
        let width = config.bucket_width_ms();
        let aligned = now_ms - now_ms % width;
        let idx = ((now_ms / width) % config.num_buckets as u64) as usize;
        let mut buckets = self.buckets.lock();
        let bucket = &mut buckets[idx];
        if bucket.start_ms != aligned {
            *bucket = Bucket {
                start_ms: aligned,
                total: 0,
                errors: 0,
            };
        }
        bucket.total += 1;
        if failure {
            bucket.errors += 1;
        }
    }

    fn window_totals(&self, config: &ErrorRateConfig, now_ms: u64) -> (u32, u32) {
        let min_start = now_ms.saturating_sub(config.window_ms);
        let buckets = self.buckets.lock();
        let mut total = 0;
        let mut errors = 0;
        for bucket in buckets.iter() {
            if bucket.start_ms >= min_start && bucket.total > 0 {
                total += bucket.total;
                errors += bucket.errors;
            }
        }
        (total, errors)
    }

    fn reset_window(&self) {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            *bucket = Bucket::default();
        }
    }

    fn enter(&self, state: CircuitState, now_ms: u64) {
        *self.state.write() = state;
        self.half_open_errors.store(0, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::Relaxed);
        self.last_update_ms.store(now_ms, Ordering::Relaxed);
        self.reset_window();
    }

    /// Preserve transitions keep the rolling window so worsening or
    /// recovery keeps being judged on live traffic.
    fn enter_keep_window(&self, state: CircuitState, now_ms: u64) {
        *self.state.write() = state;
        self.last_update_ms.store(now_ms, Ordering::Relaxed);
    }
}

pub struct ErrorRateBreaker {
    config: ErrorRateConfig,
    states: RwLock<HashMap<String, Arc<RateStatus>>>,
}

impl ErrorRateBreaker {
    pub const NAME: &'static str = "errorRate";

    pub fn new(config: ErrorRateConfig) -> Self {
        Self {
            config: config.normalized(),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ErrorRateConfig {
        &self.config
    }

    fn status(&self, instance_id: &str, now_ms: u64) -> Arc<RateStatus> {
        if let Some(status) = self.states.read().get(instance_id) {
            status.last_access_ms.store(now_ms, Ordering::Relaxed);
            return status.clone();
        }
        let mut states = self.states.write();
        let status = states
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(RateStatus::new(self.config.num_buckets, now_ms)));
        status.last_access_ms.store(now_ms, Ordering::Relaxed);
        status.clone()
    }

    fn evaluate_closed(
        &self,
        chain: &ChainData,
        idx: usize,
        instance_id: &str,
        status: &RateStatus,
        now_ms: u64,
    ) {
        let (total, errors) = status.window_totals(&self.config, now_ms);
        if total < self.config.request_volume_threshold {
            return;
        }
        let rate = errors as f64 / total as f64;
        let state = *status.state.read();
        if rate >= self.config.error_rate_threshold {
            let accepted = match state {
                CircuitState::Closed => {
                    chain.translate(idx, instance_id, CircuitState::Closed, CircuitState::Open)
                }
                CircuitState::Preserved => {
                    chain.translate(idx, instance_id, CircuitState::Preserved, CircuitState::Open)
                }
                _ => false,
            };
            if accepted {
                status.enter(CircuitState::Open, now_ms);
            }
        } else if rate >= self.config.preserve_threshold
            && state == CircuitState::Closed
            && chain.translate(
                idx,
                instance_id,
                CircuitState::Closed,
                CircuitState::Preserved,
            )
        {
            status.enter_keep_window(CircuitState::Preserved, now_ms);
        } else if rate < self.config.preserve_threshold
            && state == CircuitState::Preserved
            && chain.translate(
                idx,
                instance_id,
                CircuitState::Preserved,
                CircuitState::Closed,
            )
        {
            // Preserved instances skip half-open on recovery.
            status.enter(CircuitState::Closed, now_ms);
        }
    }
}

impl CircuitBreakerPlugin for ErrorRateBreaker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn half_open_budget(&self) -> u32 {
        self.config.request_after_half_open
    }

    fn on_call_result(&self, chain: &ChainData, idx: usize, gauge: &InstanceGauge, now_ms: u64) {
        let status = self.status(&gauge.instance_id, now_ms);
        let state = *status.state.read();
        match state {
            CircuitState::HalfOpen => {
                if gauge.status.is_failure() {
                    let errors = status.half_open_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors >= self.config.error_count_to_open()
                        && chain.translate(
                            idx,
                            &gauge.instance_id,
                            CircuitState::HalfOpen,
                            CircuitState::Open,
                        )
                    {
                        status.enter(CircuitState::Open, now_ms);
                    }
                } else {
                    status.half_open_successes.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::Open => {}
            _ => {
                status.record(&self.config, now_ms, gauge.status.is_failure());
                self.evaluate_closed(chain, idx, &gauge.instance_id, &status, now_ms);
            }
        }
    }

    fn timing_pass(&self, chain: &ChainData, idx: usize, now_ms: u64) {
        let snapshot: Vec<(String, Arc<RateStatus>)> = {
            let states = self.states.read();
            states
                .iter()
                .map(|(id, status)| (id.clone(), status.clone()))
                .collect()
        };
        for (id, status) in &snapshot {
            let state = *status.state.read();
            match state {
                CircuitState::Open => {
                    let opened = status.last_update_ms.load(Ordering::Relaxed);
                    if chain.auto_half_open_enabled()
                        && opened + self.config.sleep_window_ms <= now_ms
                        && chain.translate(idx, id, CircuitState::Open, CircuitState::HalfOpen)
                    {
                        status.enter(CircuitState::HalfOpen, now_ms);
                    }
                }
                CircuitState::HalfOpen => {
                    let successes = status.half_open_successes.load(Ordering::Relaxed);
                    let updated = status.last_update_ms.load(Ordering::Relaxed);
                    if successes >= self.config.success_count_to_close {
                        if chain.translate(idx, id, CircuitState::HalfOpen, CircuitState::Closed) {
                            status.enter(CircuitState::Closed, now_ms);
                        }
                    } else if updated + 20 * self.config.sleep_window_ms <= now_ms
                        && chain.translate(idx, id, CircuitState::HalfOpen, CircuitState::Open)
                    {
                        status.enter(CircuitState::Open, now_ms);
                    }
                }
                CircuitState::Preserved => {
                    self.evaluate_closed(chain, idx, id, status, now_ms);
                }
                CircuitState::Closed => {}
            }
        }

        let mut expired = Vec::new();
        for (id, status) in &snapshot {
            let accessed = status.last_access_ms.load(Ordering::Relaxed);
            if accessed + self.config.metric_expired_ms <= now_ms {
                chain.translate(idx, id, CircuitState::Open, CircuitState::Closed);
                chain.translate(idx, id, CircuitState::HalfOpen, CircuitState::Closed);
                chain.translate(idx, id, CircuitState::Preserved, CircuitState::Closed);
                chain.forget(id);
                expired.push(id.clone());
            }
        }
        if !expired.is_empty() {
            let mut states = self.states.write();
            for id in expired {
                states.remove(&id);
            }
        }
    }
}
