//! Router chain: an ordered pipeline of filters that narrows an instance
//! set before load balancing.
//!
//! Default order: rule → nearby → set-division → canary → metadata. Each
//! stage receives the request's [`RouteInfo`], narrows the working set in
//! place and reports what it discarded. The chain stops when a stage ends
//! it, requests a redirect, or empties the set.

use std::collections::HashSet;
use std::sync::Arc;

use mesh_registry_core::model::rules::MetadataRouterParam;
use mesh_registry_core::{
    CircuitState, CircuitView, Instance, Location, RegistryError, Result, ReturnCode, ServiceData,
    ServiceInfo, ServiceInstances, ServiceKey,
};

pub mod canary;
pub mod metadata;
pub mod nearby;
pub mod rule;
pub mod set_division;

pub use canary::CanaryRouter;
pub use metadata::MetadataRouter;
pub use nearby::{MatchLevel, NearbyConfig, NearbyRouter};
pub use rule::RuleRouter;
pub use set_division::SetDivisionRouter;

/// Per-stage accounting of what was filtered and why; consumed by the
/// telemetry collector.
#[derive(Debug, Clone)]
pub struct RouterStatRecord {
    pub router: &'static str,
    pub kept: usize,
    pub discarded: Vec<String>,
    pub reason: &'static str,
}

/// Request-scoped routing state threaded through the chain.
pub struct RouteInfo {
    pub dest_key: ServiceKey,
    pub source: Option<ServiceInfo>,
    pub instances: ServiceInstances,
    pub dest_route_rule: Option<Arc<ServiceData>>,
    pub source_route_rule: Option<Arc<ServiceData>>,
    pub caller_location: Location,
    pub include_unhealthy: bool,
    pub include_circuit_broken: bool,
    /// Router names disabled for this request.
    pub disabled_routers: HashSet<String>,
    pub metadata_param: Option<MetadataRouterParam>,
    pub stats: Vec<RouterStatRecord>,
}

impl RouteInfo {
    pub fn new(dest_key: ServiceKey, instances: ServiceInstances) -> Self {
        Self {
            dest_key,
            source: None,
            instances,
            dest_route_rule: None,
            source_route_rule: None,
            caller_location: Location::default(),
            include_unhealthy: false,
            include_circuit_broken: false,
            disabled_routers: HashSet::new(),
            metadata_param: None,
            stats: Vec::new(),
        }
    }

    /// Whether an instance may serve this request, honoring the
    /// include-unhealthy and include-circuit-broken flags. Half-open and
    /// preserved instances stay selectable; the balancer gates half-open
    /// budgets.
    pub fn is_selectable(&self, instance: &Instance, circuit: &CircuitView) -> bool {
        if !self.include_unhealthy && !instance.is_healthy() {
            return false;
        }
        if !self.include_circuit_broken && circuit.state_of(instance.id()) == CircuitState::Open {
            return false;
        }
        true
    }

    pub fn source_metadata_value(&self, key: &str) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|info| info.metadata.get(key))
            .map(String::as_str)
    }

    pub fn record_stat(&mut self, router: &'static str, reason: &'static str, discarded: Vec<String>) {
        let kept = self.instances.available().len();
        if !discarded.is_empty() {
            tracing::debug!(
                service = %self.dest_key,
                router,
                kept,
                discarded = discarded.len(),
                reason,
                "router narrowed instance set"
            );
        }
        self.stats.push(RouterStatRecord {
            router,
            kept,
            discarded,
            reason,
        });
    }
}

/// What a stage asks of the chain.
#[derive(Debug)]
pub enum RouteAction {
    Continue,
    EndChain,
    Redirect(ServiceKey),
}

/// Chain outcome.
#[derive(Debug)]
pub enum RouteOutcome {
    Narrowed,
    Redirect(ServiceKey),
}

pub trait ServiceRouter: Send + Sync {
    fn name(&self) -> &'static str;

    fn route(&self, info: &mut RouteInfo) -> Result<RouteAction>;
}

/// Chain assembly configuration.
#[derive(Debug, Clone)]
pub struct RouterChainConfig {
    /// Router names, in execution order.
    pub chain: Vec<String>,
    pub nearby: NearbyConfig,
}

impl Default for RouterChainConfig {
    fn default() -> Self {
        Self {
            chain: vec![
                RuleRouter::NAME.to_string(),
                NearbyRouter::NAME.to_string(),
                SetDivisionRouter::NAME.to_string(),
                CanaryRouter::NAME.to_string(),
                MetadataRouter::NAME.to_string(),
            ],
            nearby: NearbyConfig::default(),
        }
    }
}

pub struct RouterChain {
    routers: Vec<Box<dyn ServiceRouter>>,
}

impl std::fmt::Debug for RouterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterChain")
            .field("routers", &self.routers.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl RouterChain {
    pub fn new(config: &RouterChainConfig) -> Result<Self> {
        let mut routers: Vec<Box<dyn ServiceRouter>> = Vec::new();
        for name in &config.chain {
            match name.as_str() {
                RuleRouter::NAME => routers.push(Box::new(RuleRouter::new())),
                NearbyRouter::NAME => {
                    routers.push(Box::new(NearbyRouter::new(config.nearby.clone())))
                }
                SetDivisionRouter::NAME => routers.push(Box::new(SetDivisionRouter::new())),
                CanaryRouter::NAME => routers.push(Box::new(CanaryRouter::new())),
                MetadataRouter::NAME => routers.push(Box::new(MetadataRouter::new())),
                other => {
                    return Err(RegistryError::with_detail(
                        ReturnCode::PluginError,
                        format!("unknown service router {other}"),
                    ));
                }
            }
        }
        Ok(Self { routers })
    }

    /// Runs the chain over `info`, narrowing its working set in place.
    pub fn execute(&self, info: &mut RouteInfo) -> Result<RouteOutcome> {
        for router in &self.routers {
            if info.disabled_routers.contains(router.name()) {
                continue;
            }
            if info.instances.available().is_empty() {
                break;
            }
            match router.route(info)? {
                RouteAction::Continue => {}
                RouteAction::EndChain => break,
                RouteAction::Redirect(target) => return Ok(RouteOutcome::Redirect(target)),
            }
        }
        Ok(RouteOutcome::Narrowed)
    }
}

/// Final availability gate applied after the chain: drops unhealthy and
/// circuit-open instances unless the request flags allow them. Guarantees
/// a returned pick is never open/unhealthy without opt-in.
pub fn apply_availability_filter(info: &mut RouteInfo) {
    let circuit = info.instances.circuit();
    let current = info.instances.available().clone();
    let mut kept = Vec::with_capacity(current.len());
    let mut discarded = Vec::new();
    for instance in current.instances() {
        if info.is_selectable(instance, &circuit) {
            kept.push(instance.clone());
        } else {
            discarded.push(instance.id().to_string());
        }
    }
    if discarded.is_empty() {
        return;
    }
    let narrowed = Arc::new(mesh_registry_core::InstancesSet::with_subset(
        kept,
        current.subset_labels().clone(),
    ));
    info.instances.narrow(narrowed);
    info.record_stat("availability", "unhealthy or circuit-open", discarded);
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_chain_builds() {
        let chain = RouterChain::new(&RouterChainConfig::default()).unwrap();
        assert_eq!(chain.routers.len(), 5);
    }

    #[test]
    fn unknown_router_is_rejected() {
        let config = RouterChainConfig {
            chain: vec!["mystery".to_string()],
            ..Default::default()
        };
        let err = RouterChain::new(&config).unwrap_err();
        assert_eq!(err.code(), ReturnCode::PluginError);
    }

    #[test]
    fn disabled_router_is_skipped() {
        let chain = RouterChain::new(&RouterChainConfig::default()).unwrap();
        let mut info = info_for(vec![inst("a", true), inst("b", false)]);
        info.metadata_param = Some(MetadataRouterParam {
            metadata: HashMap::from([("env".to_string(), "canary".to_string())]),
            failover: mesh_registry_core::MetadataFailover::None,
        });
        info.disabled_routers.insert(MetadataRouter::NAME.to_string());
        // With the metadata router disabled the (unmatchable) param is
        // ignored and the chain passes through.
        chain.execute(&mut info).unwrap();
        assert_eq!(ids(&info), vec!["a", "b"]);
    }

    #[test]
    fn availability_filter_drops_unhealthy() {
        let mut info = info_for(vec![inst("a", true), inst("b", false)]);
        apply_availability_filter(&mut info);
        assert_eq!(ids(&info), vec!["a"]);
        assert_eq!(info.stats.len(), 1);
        assert_eq!(info.stats[0].discarded, vec!["b".to_string()]);
    }

    #[test]
    fn availability_filter_honors_include_unhealthy() {
        let mut info = info_for(vec![inst("a", true), inst("b", false)]);
        info.include_unhealthy = true;
        apply_availability_filter(&mut info);
        assert_eq!(ids(&info), vec!["a", "b"]);
    }

    #[test]
    fn availability_filter_drops_circuit_open() {
        let info_template = info_for(vec![inst("a", true), inst("b", true)]);
        let service = info_template.instances.service().clone();
        let mut open = std::collections::HashSet::new();
        open.insert("b".to_string());
        service.publish_circuit(open, HashMap::new(), Default::default());

        let mut info = info_template;
        apply_availability_filter(&mut info);
        assert_eq!(ids(&info), vec!["a"]);

        // Opt-in keeps the broken instance.
        let mut info2 = info_for(vec![inst("a", true), inst("b", true)]);
        let service2 = info2.instances.service().clone();
        let mut open2 = std::collections::HashSet::new();
        open2.insert("b".to_string());
        service2.publish_circuit(open2, HashMap::new(), Default::default());
        info2.include_circuit_broken = true;
        apply_availability_filter(&mut info2);
        assert_eq!(ids(&info2), vec!["a", "b"]);
    }
}
