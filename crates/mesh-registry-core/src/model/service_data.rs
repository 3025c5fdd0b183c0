use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::rules::{CircuitBreakerConfigData, RateLimitData, RouteRuleData};
use super::{Instance, ServiceKey};

/// Kind tag of a cached service-data snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataKind {
    Instances,
    RouteRule,
    RateLimitRule,
    CircuitBreakerConfig,
}

impl DataKind {
    pub const ALL: [DataKind; 4] = [
        DataKind::Instances,
        DataKind::RouteRule,
        DataKind::RateLimitRule,
        DataKind::CircuitBreakerConfig,
    ];

    /// Stable tag used in snapshot file names.
    pub fn tag(self) -> &'static str {
        match self {
            DataKind::Instances => "instances",
            DataKind::RouteRule => "routing",
            DataKind::RateLimitRule => "ratelimit",
            DataKind::CircuitBreakerConfig => "circuitbreaker",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Sync status of a cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataStatus {
    /// No subscription has produced data yet.
    NotInit,
    /// Loaded from the local snapshot directory; valid only until first sync.
    LoadedFromDisk,
    /// At least one successful sync has happened.
    Syncing,
    /// The control plane disowned the key.
    NotFound,
}

/// Opaque precomputed lookup structure a load-balancer policy attaches to an
/// instance set (hash ring, maglev table, weight prefix sums).
pub trait Selector: Send + Sync + Any {
    fn as_any(&self) -> &dyn Any;
}

/// Reference-counted working view of instances, produced by a router stage
/// or a subset selection. Carries its origin subset labels and a lazily
/// built [`Selector`].
pub struct InstancesSet {
    instances: Vec<Arc<Instance>>,
    subset: BTreeMap<String, String>,
    selector: ArcSwapOption<Box<dyn Selector>>,
    build_lock: Mutex<()>,
}

impl InstancesSet {
    pub fn new(instances: Vec<Arc<Instance>>) -> Self {
        Self::with_subset(instances, BTreeMap::new())
    }

    pub fn with_subset(instances: Vec<Arc<Instance>>, subset: BTreeMap<String, String>) -> Self {
        Self {
            instances,
            subset,
            selector: ArcSwapOption::const_empty(),
            build_lock: Mutex::new(()),
        }
    }

    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn subset_labels(&self) -> &BTreeMap<String, String> {
        &self.subset
    }

    /// Canonical `k=v|k=v` form of the subset labels; keys are ordered.
    pub fn subset_key(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.subset {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    /// Returns the cached selector, building it under the per-set lock on
    /// first use. The builder runs at most once per set.
    pub fn selector_or_build<F>(&self, build: F) -> Arc<Box<dyn Selector>>
    where
        F: FnOnce() -> Box<dyn Selector>,
    {
        if let Some(existing) = self.selector.load_full() {
            return existing;
        }
        let _guard = self.build_lock.lock();
        if let Some(existing) = self.selector.load_full() {
            return existing;
        }
        let built = Arc::new(build());
        self.selector.store(Some(built.clone()));
        built
    }

    /// Drops the cached selector; used when half-open membership changes
    /// invalidate precomputed weights.
    pub fn clear_selector(&self) {
        self.selector.store(None);
    }
}

impl fmt::Debug for InstancesSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancesSet")
            .field("len", &self.instances.len())
            .field("subset", &self.subset)
            .finish()
    }
}

/// Instances payload of a snapshot: the full instance list, an id index and
/// the derived available set (non-isolated, weight > 0) selector caches
/// attach to.
pub struct InstancesData {
    instances: Vec<Arc<Instance>>,
    by_id: HashMap<String, Arc<Instance>>,
    available: Arc<InstancesSet>,
    metadata: HashMap<String, String>,
}

impl InstancesData {
    pub fn new(instances: Vec<Instance>, metadata: HashMap<String, String>) -> Self {
        Self::from_shared(instances.into_iter().map(Arc::new).collect(), metadata)
    }

    pub fn from_shared(instances: Vec<Arc<Instance>>, metadata: HashMap<String, String>) -> Self {
        let by_id = instances
            .iter()
            .map(|inst| (inst.id().to_string(), inst.clone()))
            .collect();
        let available = Arc::new(InstancesSet::new(
            instances
                .iter()
                .filter(|inst| !inst.is_isolated() && inst.weight() > 0)
                .cloned()
                .collect(),
        ));
        Self {
            instances,
            by_id,
            available,
            metadata,
        }
    }

    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    pub fn find(&self, id: &str) -> Option<&Arc<Instance>> {
        self.by_id.get(id)
    }

    /// The stable non-isolated positive-weight set for this snapshot.
    pub fn available(&self) -> &Arc<InstancesSet> {
        &self.available
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

impl fmt::Debug for InstancesData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancesData")
            .field("instances", &self.instances.len())
            .field("available", &self.available.len())
            .finish()
    }
}

/// Typed payload of a snapshot.
#[derive(Debug)]
pub enum DataPayload {
    Instances(InstancesData),
    RouteRule(RouteRuleData),
    RateLimit(RateLimitData),
    CircuitBreaker(CircuitBreakerConfigData),
    /// `NotFound` / `NotInit` entries carry no payload.
    Empty,
}

/// An atomically swappable, never-mutated snapshot of one `(service, kind)`.
///
/// A new revision publishes a new `ServiceData`; the previous snapshot is
/// queued for reclamation once no reader holds it. The only mutable part is
/// the local cache version, bumped on every sync touch so freshness tracking
/// survives revision-unchanged replies without republishing.
#[derive(Debug)]
pub struct ServiceData {
    key: ServiceKey,
    kind: DataKind,
    revision: String,
    status: DataStatus,
    cache_version: AtomicU64,
    payload: DataPayload,
}

impl ServiceData {
    pub fn new(
        key: ServiceKey,
        kind: DataKind,
        revision: impl Into<String>,
        status: DataStatus,
        payload: DataPayload,
    ) -> Self {
        Self {
            key,
            kind,
            revision: revision.into(),
            status,
            cache_version: AtomicU64::new(0),
            payload,
        }
    }

    pub fn not_found(key: ServiceKey, kind: DataKind) -> Self {
        Self::new(key, kind, "", DataStatus::NotFound, DataPayload::Empty)
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn status(&self) -> DataStatus {
        self.status
    }

    pub fn cache_version(&self) -> u64 {
        self.cache_version.load(Ordering::Acquire)
    }

    pub fn set_cache_version(&self, version: u64) {
        self.cache_version.store(version, Ordering::Release);
    }

    pub fn payload(&self) -> &DataPayload {
        &self.payload
    }

    pub fn instances(&self) -> Option<&InstancesData> {
        match &self.payload {
            DataPayload::Instances(data) => Some(data),
            _ => None,
        }
    }

    pub fn route_rule(&self) -> Option<&RouteRuleData> {
        match &self.payload {
            DataPayload::RouteRule(data) => Some(data),
            _ => None,
        }
    }

    pub fn rate_limit(&self) -> Option<&RateLimitData> {
        match &self.payload {
            DataPayload::RateLimit(data) => Some(data),
            _ => None,
        }
    }

    pub fn circuit_breaker_config(&self) -> Option<&CircuitBreakerConfigData> {
        match &self.payload {
            DataPayload::CircuitBreaker(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker(u32);
    impl Selector for Marker {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn instance(id: &str, isolate: bool, weight: u32) -> Instance {
        Instance::builder(id, "127.0.0.1", 8000)
            .isolate(isolate)
            .weight(weight)
            .build()
    }

    #[test]
    fn available_set_filters_isolated_and_zero_weight() {
        let data = InstancesData::new(
            vec![
                instance("a", false, 100),
                instance("b", true, 100),
                instance("c", false, 0),
            ],
            HashMap::new(),
        );
        assert_eq!(data.instances().len(), 3);
        assert_eq!(data.available().len(), 1);
        assert_eq!(data.available().instances()[0].id(), "a");
    }

    #[test]
    fn selector_builds_once() {
        let set = InstancesSet::new(vec![]);
        let first = set.selector_or_build(|| Box::new(Marker(1)));
        let second = set.selector_or_build(|| Box::new(Marker(2)));
        assert!(Arc::ptr_eq(&first, &second));
        let marker = second.as_any().downcast_ref::<Marker>().unwrap();
        assert_eq!(marker.0, 1);
    }

    #[test]
    fn subset_key_is_ordered() {
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "base".to_string());
        labels.insert("az".to_string(), "sz1".to_string());
        let set = InstancesSet::with_subset(vec![], labels);
        assert_eq!(set.subset_key(), "az=sz1|env=base");
    }

    #[test]
    fn cache_version_bumps_without_republish() {
        let data = ServiceData::new(
            ServiceKey::new("Test", "echo"),
            DataKind::Instances,
            "rev-1",
            DataStatus::Syncing,
            DataPayload::Empty,
        );
        assert_eq!(data.cache_version(), 0);
        data.set_cache_version(3);
        assert_eq!(data.cache_version(), 3);
        assert_eq!(data.revision(), "rev-1");
    }
}
