//! Per-`(service, rule, labels)` sliding-window quota state.
//!
//! Each window carries one bucket per `(amount, duration)` pair of its
//! rule; a grant must fit every bucket. Remote-mode windows additionally
//! track optimistic counters against the server-approved budget and the
//! deltas pending reconciliation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use mesh_registry_core::model::rules::{LimitAmount, LimitMode, RateLimitRule};
use mesh_registry_core::ServiceKey;

use crate::climb::ClimbState;
use crate::{QuotaResultInfo, QuotaVerdict};

#[derive(Debug)]
struct Bucket {
    base_max: u64,
    /// Climb-adjusted ceiling; equals `base_max` without a climb config.
    current_max: u64,
    duration_ms: u64,
    window_start_ms: u64,
    used: u64,
    limited: u64,
}

impl Bucket {
    fn new(amount: &LimitAmount) -> Self {
        Self {
            base_max: amount.max_amount,
            current_max: amount.max_amount,
            duration_ms: amount.duration_ms.max(1),
            window_start_ms: 0,
            used: 0,
            limited: 0,
        }
    }

    fn roll(&mut self, now_ms: u64) {
        let aligned = now_ms - now_ms % self.duration_ms;
        if aligned != self.window_start_ms {
            self.window_start_ms = aligned;
            self.used = 0;
            self.limited = 0;
        }
    }
}

/// Remote reconciliation side of a window.
#[derive(Debug, Default)]
pub struct RemoteState {
    pub pending_allowed: u64,
    pub pending_limited: u64,
    pub last_reconcile_ms: u64,
    /// Tokens the limiter cluster granted for the current cycle.
    pub approved_remaining: u64,
    /// Serving on local counters only, either before the first
    /// reconciliation or after the cluster became unreachable.
    pub degraded: bool,
    pub needs_push: bool,
}

#[derive(Debug)]
pub struct RateLimitWindow {
    service_key: ServiceKey,
    rule_id: String,
    rule_revision: String,
    label_key: String,
    mode: LimitMode,
    buckets: Mutex<Vec<Bucket>>,
    remote: Mutex<RemoteState>,
    climb: Option<Mutex<ClimbState>>,
    last_access_ms: AtomicU64,
}

impl RateLimitWindow {
    pub fn new(
        service_key: ServiceKey,
        rule: &RateLimitRule,
        label_key: String,
        now_ms: u64,
    ) -> Self {
        let buckets = rule.amounts.iter().map(Bucket::new).collect();
        let remote = RemoteState {
            // A freshly materialized global window serves locally until
            // the first reconciliation lands.
            degraded: rule.mode == LimitMode::Global,
            ..Default::default()
        };
        Self {
            service_key,
            rule_id: rule.id.clone(),
            rule_revision: rule.revision.clone(),
            label_key,
            mode: rule.mode,
            buckets: Mutex::new(buckets),
            remote: Mutex::new(remote),
            climb: rule.climb.clone().map(|config| Mutex::new(ClimbState::new(config))),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.service_key
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn rule_revision(&self) -> &str {
        &self.rule_revision
    }

    pub fn label_key(&self) -> &str {
        &self.label_key
    }

    pub fn mode(&self) -> LimitMode {
        self.mode
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Attempts to take `amount` tokens from every bucket.
    pub fn acquire(&self, amount: u64, now_ms: u64) -> (QuotaVerdict, QuotaResultInfo) {
        self.last_access_ms.fetch_max(now_ms, Ordering::Relaxed);
        let degraded = self.mode == LimitMode::Global && self.remote.lock().degraded;

        let mut buckets = self.buckets.lock();
        let mut tightest_left = u64::MAX;
        let mut tightest = (u64::MAX, 0u64);
        let mut grant = true;
        for bucket in buckets.iter_mut() {
            bucket.roll(now_ms);
            let max = bucket.current_max;
            // Oversized requests never fit: always limited, never negative.
            if amount > max || bucket.used + amount > max {
                grant = false;
            }
            let left = max.saturating_sub(bucket.used);
            if left < tightest_left {
                tightest_left = left;
                tightest = (max, bucket.duration_ms);
            }
        }
        if buckets.is_empty() {
            return (
                QuotaVerdict::Ok,
                QuotaResultInfo {
                    left: u64::MAX,
                    all: u64::MAX,
                    duration_ms: 0,
                    is_degrade: degraded,
                },
            );
        }
        if amount == 0 {
            // Probe-only request: report state without consuming.
            return (
                QuotaVerdict::Ok,
                QuotaResultInfo {
                    left: tightest_left,
                    all: tightest.0,
                    duration_ms: tightest.1,
                    is_degrade: degraded,
                },
            );
        }

        let verdict = if grant {
            for bucket in buckets.iter_mut() {
                bucket.used += amount;
            }
            QuotaVerdict::Ok
        } else {
            for bucket in buckets.iter_mut() {
                bucket.limited += amount;
            }
            QuotaVerdict::Limited
        };
        let left = buckets
            .iter()
            .map(|bucket| bucket.current_max.saturating_sub(bucket.used))
            .min()
            .unwrap_or(0);
        drop(buckets);

        if self.mode == LimitMode::Global {
            let mut remote = self.remote.lock();
            match verdict {
                QuotaVerdict::Ok => {
                    remote.pending_allowed += amount;
                    if remote.approved_remaining >= amount {
                        remote.approved_remaining -= amount;
                    } else {
                        remote.approved_remaining = 0;
                        remote.needs_push = true;
                    }
                }
                QuotaVerdict::Limited => {
                    remote.pending_limited += amount;
                    remote.needs_push = true;
                }
            }
        }

        (
            verdict,
            QuotaResultInfo {
                left,
                all: tightest.0,
                duration_ms: tightest.1,
                is_degrade: degraded,
            },
        )
    }

    /// Feeds a call outcome into the climb adjuster and applies any new
    /// ceilings.
    pub fn record_call(&self, success: bool, latency_ms: u64, now_ms: u64) {
        let Some(climb) = &self.climb else {
            return;
        };
        let adjusted = {
            let mut state = climb.lock();
            state.record(success, latency_ms);
            state.maybe_adjust(now_ms)
        };
        if let Some(factor) = adjusted {
            let mut buckets = self.buckets.lock();
            for bucket in buckets.iter_mut() {
                bucket.current_max = factor.apply(bucket.base_max);
            }
        }
    }

    /// Takes the deltas pending reconciliation, resetting them.
    pub fn take_pending(&self) -> Option<(u64, u64)> {
        let mut remote = self.remote.lock();
        if remote.pending_allowed == 0 && remote.pending_limited == 0 && !remote.needs_push {
            return None;
        }
        let taken = (remote.pending_allowed, remote.pending_limited);
        remote.pending_allowed = 0;
        remote.pending_limited = 0;
        remote.needs_push = false;
        Some(taken)
    }

    /// Applies a successful reconciliation reply.
    pub fn apply_reconcile(&self, approved_remaining: u64, now_ms: u64) {
        let mut remote = self.remote.lock();
        remote.approved_remaining = approved_remaining;
        remote.last_reconcile_ms = now_ms;
        remote.degraded = false;
    }

    /// Marks the limiter cluster unreachable.
    pub fn degrade(&self) {
        let mut remote = self.remote.lock();
        if !remote.degraded {
            tracing::warn!(
                rule = %self.rule_id,
                labels = %self.label_key,
                "rate limiter unreachable, degrading to local counters"
            );
        }
        remote.degraded = true;
    }

    pub fn is_degraded(&self) -> bool {
        self.remote.lock().degraded
    }
}
