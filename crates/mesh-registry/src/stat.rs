//! API call statistics.
//!
//! Every facade entry records `(api, return code, latency bucket)`; the
//! reactor flushes the aggregate periodically through `tracing` (and the
//! metrics facade when enabled), then resets the counters.

use std::collections::HashMap;

use parking_lot::Mutex;

use mesh_registry_core::ReturnCode;

/// Facade entry points, as reported in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKind {
    GetOneInstance,
    GetInstances,
    UpdateServiceCallResult,
    Register,
    Deregister,
    Heartbeat,
    GetQuota,
    UpdateLimitCallResult,
}

impl ApiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiKind::GetOneInstance => "getOneInstance",
            ApiKind::GetInstances => "getInstances",
            ApiKind::UpdateServiceCallResult => "updateServiceCallResult",
            ApiKind::Register => "register",
            ApiKind::Deregister => "deregister",
            ApiKind::Heartbeat => "heartbeat",
            ApiKind::GetQuota => "getQuota",
            ApiKind::UpdateLimitCallResult => "updateLimitCallResult",
        }
    }
}

const BUCKET_BOUNDS_MS: [u64; 4] = [10, 50, 100, 500];

/// Upper-bound label of a latency bucket.
fn bucket_label(latency_ms: u64) -> &'static str {
    match BUCKET_BOUNDS_MS.iter().position(|bound| latency_ms < *bound) {
        Some(0) => "<10ms",
        Some(1) => "<50ms",
        Some(2) => "<100ms",
        Some(3) => "<500ms",
        _ => ">=500ms",
    }
}

#[derive(Default)]
pub struct ApiStatRegistry {
    samples: Mutex<HashMap<(ApiKind, u32, &'static str), u64>>,
}

impl ApiStatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, api: ApiKind, code: ReturnCode, latency_ms: u64) {
        let bucket = bucket_label(latency_ms);
        *self
            .samples
            .lock()
            .entry((api, code.as_u32(), bucket))
            .or_insert(0) += 1;

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "registry_api_calls_total",
            "api" => api.as_str(),
            "code" => code.as_u32().to_string(),
            "latency" => bucket,
        )
        .increment(1);
    }

    /// Logs and drains the aggregate.
    pub fn flush(&self) {
        let drained: Vec<_> = {
            let mut samples = self.samples.lock();
            samples.drain().collect()
        };
        for ((api, code, bucket), count) in drained {
            tracing::info!(
                api = api.as_str(),
                code,
                latency = bucket,
                count,
                "api stat"
            );
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_buckets() {
        assert_eq!(bucket_label(3), "<10ms");
        assert_eq!(bucket_label(10), "<50ms");
        assert_eq!(bucket_label(72), "<100ms");
        assert_eq!(bucket_label(499), "<500ms");
        assert_eq!(bucket_label(500), ">=500ms");
        assert_eq!(bucket_label(30_000), ">=500ms");
    }

    #[test]
    fn record_aggregates_and_flush_drains() {
        let stats = ApiStatRegistry::new();
        stats.record(ApiKind::GetOneInstance, ReturnCode::Ok, 3);
        stats.record(ApiKind::GetOneInstance, ReturnCode::Ok, 4);
        stats.record(ApiKind::GetQuota, ReturnCode::RateLimit, 1);
        assert_eq!(stats.sample_count(), 2);
        stats.flush();
        assert_eq!(stats.sample_count(), 0);
    }
}
