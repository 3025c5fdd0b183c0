//! Rate-limit quota management.
//!
//! A [`RateLimitWindow`] materializes per `(service, rule, label
//! combination)` on first acquisition and lives in an RCU map. Local-mode
//! windows decide purely on their buckets; global-mode windows reconcile
//! accumulated deltas with the limiter cluster in the background and
//! degrade to local counters when the cluster is unreachable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use mesh_registry_core::model::rules::{LimitMode, RateLimitData};
use mesh_registry_core::{RcuMap, ServiceKey};

pub mod climb;
pub mod remote;
pub mod rule;
pub mod window;

pub use remote::{LimitTransport, ReconcileRequest, ReconcileResponse};
pub use rule::RegexCache;
pub use window::RateLimitWindow;

/// Limiting mode of the whole client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitMode {
    Disable,
    #[default]
    Local,
    Global,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub mode: RateLimitMode,
    /// Limiter cluster for global mode.
    pub cluster: Option<ServiceKey>,
    /// Windows idle past this are reclaimed by the sweep.
    pub window_expire_ms: u64,
    pub reconcile_interval_ms: u64,
    pub rcu_grace_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            mode: RateLimitMode::Local,
            cluster: None,
            window_expire_ms: 60_000,
            reconcile_interval_ms: 1_000,
            rcu_grace_ms: 2_000,
        }
    }
}

/// One quota acquisition.
#[derive(Debug, Clone)]
pub struct QuotaRequest {
    pub service_key: ServiceKey,
    pub labels: HashMap<String, String>,
    pub acquire_amount: u64,
}

impl QuotaRequest {
    pub fn new(service_key: ServiceKey) -> Self {
        Self {
            service_key,
            labels: HashMap::new(),
            acquire_amount: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaVerdict {
    Ok,
    Limited,
}

/// Structured info accompanying every verdict.
#[derive(Debug, Clone, Copy)]
pub struct QuotaResultInfo {
    pub left: u64,
    pub all: u64,
    pub duration_ms: u64,
    pub is_degrade: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaResponse {
    pub verdict: QuotaVerdict,
    pub info: QuotaResultInfo,
}

impl QuotaResponse {
    fn unlimited() -> Self {
        Self {
            verdict: QuotaVerdict::Ok,
            info: QuotaResultInfo {
                left: u64::MAX,
                all: u64::MAX,
                duration_ms: 0,
                is_degrade: false,
            },
        }
    }
}

/// Caller-reported outcome used by the climb adjuster.
#[derive(Debug, Clone)]
pub struct LimitCallResult {
    pub service_key: ServiceKey,
    pub labels: HashMap<String, String>,
    pub success: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    service: ServiceKey,
    rule_id: String,
    label_key: String,
}

pub struct QuotaManager {
    config: RateLimitConfig,
    windows: RcuMap<WindowKey, RateLimitWindow>,
    regexes: RegexCache,
    transport: RwLock<Option<Arc<dyn LimitTransport>>>,
    /// Serializes first materialization of a window.
    init_lock: Mutex<()>,
}

impl QuotaManager {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RcuMap::new(),
            regexes: RegexCache::default(),
            transport: RwLock::new(None),
            init_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn set_transport(&self, transport: Arc<dyn LimitTransport>) {
        *self.transport.write() = Some(transport);
    }

    fn window_for(
        &self,
        key: WindowKey,
        rule: &mesh_registry_core::model::rules::RateLimitRule,
        label_key: &str,
        now_ms: u64,
    ) -> Arc<RateLimitWindow> {
        if let Some(window) = self.windows.get(&key, now_ms) {
            if window.rule_revision() == rule.revision {
                return window;
            }
            // The rule changed underneath the window: rebuild it.
        }
        let _guard = self.init_lock.lock();
        if let Some(window) = self.windows.get(&key, now_ms) {
            if window.rule_revision() == rule.revision {
                return window;
            }
        }
        let window = Arc::new(RateLimitWindow::new(
            key.service.clone(),
            rule,
            label_key.to_string(),
            now_ms,
        ));
        self.windows.update(key, window.clone(), now_ms);
        window
    }

    /// Resolves the rule, materializes the window and decides the verdict.
    /// A request matched by no rule is unlimited.
    pub fn get_quota(
        &self,
        request: &QuotaRequest,
        rules: Option<&RateLimitData>,
        now_ms: u64,
    ) -> QuotaResponse {
        if self.config.mode == RateLimitMode::Disable {
            return QuotaResponse::unlimited();
        }
        let Some(rules) = rules else {
            return QuotaResponse::unlimited();
        };
        let Some(resolved) = rule::resolve(rules, &request.labels, &self.regexes) else {
            return QuotaResponse::unlimited();
        };
        let key = WindowKey {
            service: request.service_key.clone(),
            rule_id: resolved.rule.id.clone(),
            label_key: resolved.label_key.clone(),
        };
        let window = self.window_for(key, resolved.rule, &resolved.label_key, now_ms);
        let (verdict, info) = window.acquire(request.acquire_amount, now_ms);
        if verdict == QuotaVerdict::Limited {
            tracing::debug!(
                service = %request.service_key,
                rule = %resolved.rule.id,
                labels = %resolved.label_key,
                "request rate limited"
            );
        }
        QuotaResponse { verdict, info }
    }

    /// Feeds a call outcome into the matched window's climb adjuster.
    pub fn update_call_result(
        &self,
        result: &LimitCallResult,
        rules: Option<&RateLimitData>,
        now_ms: u64,
    ) {
        let Some(rules) = rules else {
            return;
        };
        let Some(resolved) = rule::resolve(rules, &result.labels, &self.regexes) else {
            return;
        };
        let key = WindowKey {
            service: result.service_key.clone(),
            rule_id: resolved.rule.id.clone(),
            label_key: resolved.label_key,
        };
        if let Some(window) = self.windows.get(&key, now_ms) {
            window.record_call(result.success, result.latency_ms, now_ms);
        }
    }

    /// Pushes pending deltas of every global window and applies the
    /// approvals. Unreachable cluster degrades the affected windows.
    pub async fn reconcile_due(&self, now_ms: u64) {
        let transport = self.transport.read().clone();
        for window in self.windows.values() {
            if window.mode() != LimitMode::Global {
                continue;
            }
            let Some((allowed, limited)) = window.take_pending() else {
                continue;
            };
            let Some(transport) = &transport else {
                window.degrade();
                continue;
            };
            let request = ReconcileRequest {
                service_key: window.service_key().clone(),
                rule_id: window.rule_id().to_string(),
                label_key: window.label_key().to_string(),
                allowed_delta: allowed,
                limited_delta: limited,
            };
            match transport.reconcile(request).await {
                Ok(response) => window.apply_reconcile(response.approved_remaining, now_ms),
                Err(err) => {
                    tracing::warn!(error = %err, "limiter reconciliation failed");
                    window.degrade();
                }
            }
        }
    }

    /// Reclaims windows idle past the expiry, flushing pending deltas
    /// first.
    pub async fn sweep_expired(&self, now_ms: u64) {
        let min_access = now_ms.saturating_sub(self.config.window_expire_ms);
        let transport = self.transport.read().clone();
        for key in self.windows.expired_keys(min_access) {
            if let Some(window) = self.windows.get(&key, now_ms) {
                if let (Some((allowed, limited)), Some(transport)) =
                    (window.take_pending(), &transport)
                {
                    let request = ReconcileRequest {
                        service_key: key.service.clone(),
                        rule_id: key.rule_id.clone(),
                        label_key: key.label_key.clone(),
                        allowed_delta: allowed,
                        limited_delta: limited,
                    };
                    if let Err(err) = transport.reconcile(request).await {
                        tracing::debug!(error = %err, "final flush failed for expiring window");
                    }
                }
            }
            self.windows.remove(&key, now_ms);
        }
    }

    pub fn run_rcu_gc(&self, now_ms: u64) {
        self.windows
            .check_gc(now_ms.saturating_sub(self.config.rcu_grace_ms));
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_registry_core::model::rules::{LimitAmount, MatchString, RateLimitRule};
    use mesh_registry_core::{RegistryError, ReturnCode};

    fn rules() -> RateLimitData {
        RateLimitData {
            rules: vec![RateLimitRule {
                id: "r1".to_string(),
                labels: HashMap::from([("label".to_string(), MatchString::regex("v.*"))]),
                amounts: vec![LimitAmount {
                    max_amount: 100,
                    duration_ms: 1000,
                }],
                revision: "rev1".to_string(),
                ..Default::default()
            }],
        }
    }

    fn request(label: &str) -> QuotaRequest {
        QuotaRequest {
            service_key: ServiceKey::new("Test", "echo"),
            labels: HashMap::from([("label".to_string(), label.to_string())]),
            acquire_amount: 1,
        }
    }

    #[test]
    fn local_mode_enforces_bucket_amounts() {
        let manager = QuotaManager::new(RateLimitConfig::default());
        let rules = rules();
        let mut ok = 0;
        let mut limited = 0;
        for _ in 0..120 {
            let response = manager.get_quota(&request("v1"), Some(&rules), 500);
            match response.verdict {
                QuotaVerdict::Ok => ok += 1,
                QuotaVerdict::Limited => limited += 1,
            }
        }
        assert_eq!(ok, 100);
        assert_eq!(limited, 20);
    }

    #[test]
    fn unmatched_requests_are_unlimited() {
        let manager = QuotaManager::new(RateLimitConfig::default());
        let rules = rules();
        let mut req = request("v1");
        req.labels = HashMap::from([("other".to_string(), "x".to_string())]);
        let response = manager.get_quota(&req, Some(&rules), 500);
        assert_eq!(response.verdict, QuotaVerdict::Ok);
        assert_eq!(response.info.left, u64::MAX);
        assert_eq!(manager.window_count(), 0);
    }

    #[test]
    fn disable_mode_never_limits() {
        let manager = QuotaManager::new(RateLimitConfig {
            mode: RateLimitMode::Disable,
            ..Default::default()
        });
        let rules = rules();
        for _ in 0..500 {
            let response = manager.get_quota(&request("v1"), Some(&rules), 500);
            assert_eq!(response.verdict, QuotaVerdict::Ok);
        }
    }

    #[test]
    fn rule_revision_change_rebuilds_window() {
        let manager = QuotaManager::new(RateLimitConfig::default());
        let rules_v1 = rules();
        for _ in 0..100 {
            manager.get_quota(&request("v1"), Some(&rules_v1), 500);
        }
        assert_eq!(
            manager
                .get_quota(&request("v1"), Some(&rules_v1), 600)
                .verdict,
            QuotaVerdict::Limited
        );
        let mut rules_v2 = rules();
        rules_v2.rules[0].revision = "rev2".to_string();
        rules_v2.rules[0].amounts[0].max_amount = 200;
        let response = manager.get_quota(&request("v1"), Some(&rules_v2), 700);
        assert_eq!(response.verdict, QuotaVerdict::Ok);
    }

    #[test]
    fn expired_windows_are_swept() {
        let manager = QuotaManager::new(RateLimitConfig {
            window_expire_ms: 1_000,
            ..Default::default()
        });
        let rules = rules();
        manager.get_quota(&request("v1"), Some(&rules), 500);
        assert_eq!(manager.window_count(), 1);
        futures_block_on(manager.sweep_expired(5_000));
        assert_eq!(manager.window_count(), 0);
    }

    #[tokio::test]
    async fn global_mode_reconciles_and_degrades() {
        struct FlakyTransport {
            fail: std::sync::atomic::AtomicBool,
        }
        #[async_trait::async_trait]
        impl LimitTransport for FlakyTransport {
            async fn reconcile(
                &self,
                _request: ReconcileRequest,
            ) -> mesh_registry_core::Result<ReconcileResponse> {
                if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                    Err(RegistryError::new(ReturnCode::NetworkFailed))
                } else {
                    Ok(ReconcileResponse {
                        approved_remaining: 50,
                    })
                }
            }
        }

        let manager = QuotaManager::new(RateLimitConfig {
            mode: RateLimitMode::Global,
            ..Default::default()
        });
        let transport = Arc::new(FlakyTransport {
            fail: std::sync::atomic::AtomicBool::new(false),
        });
        manager.set_transport(transport.clone());

        let mut rules = rules();
        rules.rules[0].mode = mesh_registry_core::model::rules::LimitMode::Global;

        // Fresh global window serves degraded until the first reconcile.
        let response = manager.get_quota(&request("v1"), Some(&rules), 100);
        assert!(response.info.is_degrade);
        manager.reconcile_due(200).await;
        let response = manager.get_quota(&request("v1"), Some(&rules), 300);
        assert!(!response.info.is_degrade);

        // Cluster goes away: next push degrades the window again.
        transport.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        manager.get_quota(&request("v1"), Some(&rules), 400);
        manager.reconcile_due(500).await;
        let response = manager.get_quota(&request("v1"), Some(&rules), 600);
        assert!(response.info.is_degrade);
    }

    fn futures_block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("test runtime")
            .block_on(future)
    }
}
