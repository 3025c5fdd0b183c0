//! Load balancer family: the final pick from a routed instance set.
//!
//! Policies share two conventions. Selector structures (prefix sums, hash
//! rings, lookup tables) build lazily under the per-set lock and are cached
//! on the [`InstancesSet`], keyed by the circuit version where half-open
//! membership matters. And every policy gates half-open instances through
//! the service's probe budget: a half-open pick must claim a token, an
//! exhausted budget forces an alternative pick, and a balancer always makes
//! progress or returns `InstanceNotFound`.

use std::sync::Arc;

use mesh_registry_core::{
    Criteria, Instance, LocalityPick, RegistryError, Result, ReturnCode, ServiceInstances,
    ServiceKey,
};

pub mod adjuster;
pub mod c_murmur;
pub mod hash;
pub mod locality_aware;
pub mod maglev;
pub mod ring_hash;
pub mod simple_hash;
pub mod weighted_random;

pub use adjuster::{NoopWeightAdjuster, WeightAdjuster};
pub use c_murmur::CMurmurBalancer;
pub use locality_aware::LocalityAwareBalancer;
pub use maglev::MaglevBalancer;
pub use ring_hash::RingHashBalancer;
pub use simple_hash::SimpleHashBalancer;
pub use weighted_random::WeightedRandomBalancer;

/// A completed selection. The locality handle, when present, correlates
/// the pick with its feedback.
#[derive(Debug, Clone)]
pub struct Pick {
    pub instance: Arc<Instance>,
    pub locality: Option<LocalityPick>,
}

impl Pick {
    pub fn plain(instance: Arc<Instance>) -> Self {
        Self {
            instance,
            locality: None,
        }
    }
}

/// Call outcome fed back into feedback-driven balancers.
#[derive(Debug, Clone)]
pub struct CallFeedback {
    pub service_key: ServiceKey,
    pub instance_id: String,
    pub locality: Option<LocalityPick>,
    pub latency_ms: u64,
    pub success: bool,
}

pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    fn choose(&self, instances: &ServiceInstances, criteria: &Criteria) -> Result<Pick>;

    /// Feedback hook; only the locality-aware policy reacts.
    fn update_call_result(&self, _feedback: &CallFeedback) {}
}

/// Tuning knobs shared by the family, fed from `consumer.loadBalancer`.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub policy: String,
    /// Weighted-random reads adjuster-maintained weights instead of static
    /// ones.
    pub enable_dynamic_weight: bool,
    /// Virtual nodes per unit of weight fraction on the ketama ring.
    pub vnode_count: u32,
    pub hash_func: String,
    /// Maglev lookup table size; must be prime.
    pub maglev_table_size: u32,
    /// Replicas per instance for the legacy-compatible ring.
    pub compat_replicas: u32,
    pub locality: locality_aware::LocalityConfig,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            policy: WeightedRandomBalancer::NAME.to_string(),
            enable_dynamic_weight: false,
            vnode_count: 1024,
            hash_func: "murmur3".to_string(),
            maglev_table_size: 65537,
            compat_replicas: 100,
            locality: locality_aware::LocalityConfig::default(),
        }
    }
}

/// Instantiates a policy by name.
pub fn build_balancer(policy: &str, config: &BalanceConfig) -> Result<Box<dyn LoadBalancer>> {
    match policy {
        WeightedRandomBalancer::NAME => Ok(Box::new(WeightedRandomBalancer::new(
            config.enable_dynamic_weight,
        ))),
        RingHashBalancer::NAME => Ok(Box::new(RingHashBalancer::new(
            config.vnode_count,
            hash::by_name(&config.hash_func)?,
        ))),
        MaglevBalancer::NAME => MaglevBalancer::new(
            config.maglev_table_size,
            hash::by_name(&config.hash_func)?,
        )
        .map(|lb| Box::new(lb) as Box<dyn LoadBalancer>),
        CMurmurBalancer::NAME => Ok(Box::new(CMurmurBalancer::new(config.compat_replicas))),
        SimpleHashBalancer::NAME => Ok(Box::new(SimpleHashBalancer::new())),
        LocalityAwareBalancer::NAME => {
            Ok(Box::new(LocalityAwareBalancer::new(config.locality.clone())))
        }
        other => Err(RegistryError::with_detail(
            ReturnCode::PluginError,
            format!("unknown load balancer {other}"),
        )),
    }
}

/// Offers traffic to a half-open instance with remaining probe budget, if
/// any, claiming one token. Policies that keep a weighted pool call this
/// before their normal pick.
pub(crate) fn try_choose_half_open(instances: &ServiceInstances) -> Option<Arc<Instance>> {
    let view = instances.circuit();
    if view.half_open.is_empty() {
        return None;
    }
    for instance in instances.available().instances() {
        let Some(budget) = view.half_open.get(instance.id()) else {
            continue;
        };
        if *budget > 0 && instances.service().try_claim_half_open(instance.id()) {
            tracing::debug!(
                service = %instances.service().key(),
                instance = instance.id(),
                "half-open probe token claimed"
            );
            return Some(instance.clone());
        }
    }
    None
}

pub(crate) fn instance_not_found(service: &ServiceKey) -> RegistryError {
    RegistryError::with_detail(
        ReturnCode::InstanceNotFound,
        format!("no selectable instance for {service}"),
    )
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use mesh_registry_core::{
        DataKind, DataPayload, DataStatus, Instance, InstancesData, Service, ServiceData,
        ServiceInstances, ServiceKey,
    };

    pub fn instances_view(instances: Vec<Instance>) -> ServiceInstances {
        let key = ServiceKey::new("Test", "ring");
        let service = Arc::new(Service::new(key.clone(), 0));
        let data = Arc::new(ServiceData::new(
            key,
            DataKind::Instances,
            "r1",
            DataStatus::Syncing,
            DataPayload::Instances(InstancesData::new(instances, HashMap::new())),
        ));
        ServiceInstances::new(service, data).expect("instances payload")
    }

    pub fn weighted(id: &str, port: u16, weight: u32) -> Instance {
        Instance::builder(id, "10.1.0.1", port).weight(weight).build()
    }

    pub fn mark_half_open(view: &ServiceInstances, id: &str, budget: u32) {
        let mut half_open = HashMap::new();
        half_open.insert(id.to_string(), budget);
        view.service()
            .publish_circuit(HashSet::new(), half_open, HashSet::new());
    }
}
