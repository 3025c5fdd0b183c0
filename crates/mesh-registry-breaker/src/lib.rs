//! Circuit breaking for the mesh-registry client.
//!
//! Two per-instance plugins (continuous error count and windowed error
//! rate) plus a per-subset breaker run per service, driven by reported call
//! outcomes. All state transitions funnel through [`chain::ChainData`],
//! which serializes them and publishes the derived sets consumed by the
//! router chain and the load balancers.

use std::sync::Arc;

use mesh_registry_core::events::EventListeners;
use mesh_registry_core::model::rules::CircuitBreakerConfigData;
use mesh_registry_core::{
    CallStatus, CircuitState, RegistryError, Result, ReturnCode, Service, ServiceKey,
};

pub mod chain;
pub mod error_count;
pub mod error_rate;
pub mod subset;

pub use chain::{ChainData, HEALTH_CHECK_OWNER};
pub use error_count::{ErrorCountBreaker, ErrorCountConfig};
pub use error_rate::{ErrorRateBreaker, ErrorRateConfig};
pub use subset::{SubsetBreaker, SubsetBreakerConfig};

/// One reported call outcome, as consumed by the breaker plugins.
#[derive(Debug, Clone)]
pub struct InstanceGauge {
    pub service_key: ServiceKey,
    pub instance_id: String,
    pub status: CallStatus,
    pub latency_ms: u64,
    /// `subset_key#rule_id` attribution for the subset breaker.
    pub subset_key: Option<String>,
}

/// Event emitted on every accepted transition.
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    Transition {
        service: ServiceKey,
        instance_id: String,
        from: CircuitState,
        to: CircuitState,
        version: u64,
    },
}

/// A circuit-breaker plugin: reacts to call outcomes in real time and to
/// the periodic timing pass. Transitions go through the chain, never
/// directly to the service.
pub trait CircuitBreakerPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe tokens granted when this plugin moves an instance to
    /// half-open.
    fn half_open_budget(&self) -> u32;

    fn on_call_result(&self, chain: &ChainData, idx: usize, gauge: &InstanceGauge, now_ms: u64);

    fn timing_pass(&self, chain: &ChainData, idx: usize, now_ms: u64);
}

/// Assembled breaker configuration for one service.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Plugin names, in chain order.
    pub chain: Vec<String>,
    /// Interval of the reactor timing pass.
    pub check_period_ms: u64,
    pub error_count: ErrorCountConfig,
    pub error_rate: ErrorRateConfig,
    pub subset: SubsetBreakerConfig,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chain: vec![
                ErrorCountBreaker::NAME.to_string(),
                ErrorRateBreaker::NAME.to_string(),
            ],
            check_period_ms: 500,
            error_count: ErrorCountConfig::default(),
            error_rate: ErrorRateConfig::default(),
            subset: SubsetBreakerConfig::default(),
        }
    }
}

/// Per-service breaker assembly: the ordered plugins, the shared chain
/// data and the subset breaker.
pub struct CircuitBreakerChain {
    plugins: Vec<Box<dyn CircuitBreakerPlugin>>,
    data: ChainData,
    subset: SubsetBreaker,
    enabled: bool,
}

impl std::fmt::Debug for CircuitBreakerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerChain")
            .field("plugins", &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl CircuitBreakerChain {
    /// Builds the chain for a service, applying any per-service overrides
    /// pushed by the control plane.
    pub fn new(
        service: Arc<Service>,
        config: &BreakerConfig,
        overrides: Option<&CircuitBreakerConfigData>,
        listeners: EventListeners<CircuitEvent>,
    ) -> Result<Self> {
        let mut error_count = config.error_count.clone();
        let mut error_rate = config.error_rate.clone();
        let mut enabled = config.enabled;
        if let Some(overrides) = overrides {
            enabled &= overrides.enabled;
            if let Some(ec) = &overrides.error_count {
                error_count.continuous_threshold = ec.continuous_threshold;
                error_count.sleep_window_ms = ec.sleep_window_ms;
            }
            if let Some(er) = &overrides.error_rate {
                error_rate.error_rate_threshold = er.error_rate_threshold;
                error_rate.request_volume_threshold = er.request_volume_threshold;
                error_rate.sleep_window_ms = er.sleep_window_ms;
            }
        }

        let mut plugins: Vec<Box<dyn CircuitBreakerPlugin>> = Vec::new();
        for name in &config.chain {
            match name.as_str() {
                ErrorCountBreaker::NAME => {
                    plugins.push(Box::new(ErrorCountBreaker::new(error_count.clone())));
                }
                ErrorRateBreaker::NAME => {
                    plugins.push(Box::new(ErrorRateBreaker::new(error_rate.clone())));
                }
                other => {
                    return Err(RegistryError::with_detail(
                        ReturnCode::PluginError,
                        format!("unknown circuit breaker plugin {other}"),
                    ));
                }
            }
        }
        let budgets = plugins.iter().map(|p| p.half_open_budget()).collect();
        let health_budget = error_count.normalized().request_after_half_open;
        let data = ChainData::new(service.clone(), budgets, health_budget, listeners);
        let subset = SubsetBreaker::new(service, config.subset.clone());
        subset.set_enabled(enabled);
        Ok(Self {
            plugins,
            data,
            subset,
            enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn data(&self) -> &ChainData {
        &self.data
    }

    pub fn subset(&self) -> &SubsetBreaker {
        &self.subset
    }

    pub fn state_of(&self, instance_id: &str) -> CircuitState {
        self.data.state_of(instance_id)
    }

    /// Feeds one reported call outcome through every plugin and the subset
    /// breaker.
    pub fn on_call_result(&self, gauge: &InstanceGauge, now_ms: u64) {
        if !self.enabled {
            return;
        }
        for (idx, plugin) in self.plugins.iter().enumerate() {
            plugin.on_call_result(&self.data, idx, gauge, now_ms);
        }
        self.subset.on_call_result(gauge, now_ms);
    }

    /// Periodic transitions: open → half-open promotion, half-open
    /// resolution, metric expiry. Driven by the reactor.
    pub fn timing_pass(&self, now_ms: u64) {
        if !self.enabled {
            return;
        }
        for (idx, plugin) in self.plugins.iter().enumerate() {
            plugin.timing_pass(&self.data, idx, now_ms);
        }
        self.subset.timing_pass(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<Service> {
        Arc::new(Service::new(ServiceKey::new("Test", "echo"), 0))
    }

    fn gauge(status: CallStatus) -> InstanceGauge {
        InstanceGauge {
            service_key: ServiceKey::new("Test", "echo"),
            instance_id: "inst".to_string(),
            status,
            latency_ms: 1,
            subset_key: None,
        }
    }

    #[test]
    fn chain_builds_default_plugins() {
        let chain = CircuitBreakerChain::new(
            service(),
            &BreakerConfig::default(),
            None,
            EventListeners::new(),
        )
        .unwrap();
        assert_eq!(chain.plugins.len(), 2);
        assert!(chain.is_enabled());
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let config = BreakerConfig {
            chain: vec!["nope".to_string()],
            ..Default::default()
        };
        let err =
            CircuitBreakerChain::new(service(), &config, None, EventListeners::new()).unwrap_err();
        assert_eq!(err.code(), ReturnCode::PluginError);
    }

    #[test]
    fn overrides_tighten_thresholds() {
        use mesh_registry_core::model::rules::ErrorCountOverride;
        let overrides = CircuitBreakerConfigData {
            enabled: true,
            error_count: Some(ErrorCountOverride {
                continuous_threshold: 2,
                sleep_window_ms: 10_000,
            }),
            error_rate: None,
        };
        let chain = CircuitBreakerChain::new(
            service(),
            &BreakerConfig::default(),
            Some(&overrides),
            EventListeners::new(),
        )
        .unwrap();
        chain.on_call_result(&gauge(CallStatus::Error), 100);
        chain.on_call_result(&gauge(CallStatus::Error), 100);
        assert_eq!(chain.state_of("inst"), CircuitState::Open);
    }

    #[test]
    fn disabled_chain_ignores_outcomes() {
        let overrides = CircuitBreakerConfigData {
            enabled: false,
            error_count: None,
            error_rate: None,
        };
        let chain = CircuitBreakerChain::new(
            service(),
            &BreakerConfig::default(),
            Some(&overrides),
            EventListeners::new(),
        )
        .unwrap();
        for _ in 0..50 {
            chain.on_call_result(&gauge(CallStatus::Error), 100);
        }
        assert_eq!(chain.state_of("inst"), CircuitState::Closed);
    }

    #[test]
    fn first_plugin_owns_the_open_state() {
        let chain = CircuitBreakerChain::new(
            service(),
            &BreakerConfig::default(),
            None,
            EventListeners::new(),
        )
        .unwrap();
        for _ in 0..10 {
            chain.on_call_result(&gauge(CallStatus::Error), 100);
        }
        assert_eq!(chain.state_of("inst"), CircuitState::Open);
        // The error-rate plugin saw the same stream but cannot move the
        // state the error-count plugin owns.
        chain.timing_pass(100 + 30_000);
        assert_eq!(chain.state_of("inst"), CircuitState::HalfOpen);
        assert_eq!(chain.data().service().half_open_budget("inst"), Some(3));
    }
}
