use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{DataStatus, InstancesSet, ServiceData, ServiceKey};

/// Circuit state of one instance or subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    /// On-the-edge error rate: no new traffic is routed but the instance is
    /// not fully ejected, and recovery may skip half-open.
    Preserved,
}

/// Derived circuit-breaker sets published to the cache after every accepted
/// transition. Observers that see a new version also see the new sets.
#[derive(Debug, Clone, Default)]
pub struct CircuitView {
    pub version: u64,
    pub open: HashSet<String>,
    /// Half-open instances mapped to their remaining probe budget.
    pub half_open: HashMap<String, u32>,
    pub preserved: HashSet<String>,
}

impl CircuitView {
    pub fn state_of(&self, instance_id: &str) -> CircuitState {
        if self.open.contains(instance_id) {
            CircuitState::Open
        } else if self.half_open.contains_key(instance_id) {
            CircuitState::HalfOpen
        } else if self.preserved.contains(instance_id) {
            CircuitState::Preserved
        } else {
            CircuitState::Closed
        }
    }
}

/// Published per-subset breaker sets, keyed by `subset_key#rule_id`.
#[derive(Debug, Clone, Default)]
pub struct SubsetStateView {
    pub open: HashSet<String>,
    pub preserved: HashSet<String>,
}

/// Long-lived cache entry for a service: the currently-active snapshots per
/// kind live in the cache maps; this structure carries the dynamically
/// updated side-bands that publish without allocating a new snapshot.
#[derive(Debug)]
pub struct Service {
    key: ServiceKey,
    last_access_ms: AtomicU64,
    circuit: RwLock<CircuitView>,
    cb_version: AtomicU64,
    subsets: RwLock<SubsetStateView>,
    dynamic_weight_version: AtomicU64,
    dynamic_weight_sync_ms: AtomicU64,
}

impl Service {
    pub fn new(key: ServiceKey, now_ms: u64) -> Self {
        Self {
            key,
            last_access_ms: AtomicU64::new(now_ms),
            circuit: RwLock::new(CircuitView::default()),
            cb_version: AtomicU64::new(0),
            subsets: RwLock::new(SubsetStateView::default()),
            dynamic_weight_version: AtomicU64::new(0),
            dynamic_weight_sync_ms: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_access_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    pub fn cb_version(&self) -> u64 {
        self.cb_version.load(Ordering::Acquire)
    }

    /// Snapshot of the current circuit sets.
    pub fn circuit(&self) -> CircuitView {
        self.circuit.read().clone()
    }

    /// Publishes new derived sets. The version is bumped after the sets are
    /// swapped so a reader observing the new version also observes them.
    pub fn publish_circuit(
        &self,
        open: HashSet<String>,
        half_open: HashMap<String, u32>,
        preserved: HashSet<String>,
    ) -> u64 {
        let version = self.cb_version.load(Ordering::Relaxed) + 1;
        {
            let mut guard = self.circuit.write();
            guard.open = open;
            guard.half_open = half_open;
            guard.preserved = preserved;
            guard.version = version;
        }
        self.cb_version.store(version, Ordering::Release);
        version
    }

    /// Atomically claims one half-open probe token for the instance.
    /// Returns false when the instance is not half-open or its budget is
    /// exhausted.
    pub fn try_claim_half_open(&self, instance_id: &str) -> bool {
        let mut guard = self.circuit.write();
        match guard.half_open.get_mut(instance_id) {
            Some(budget) if *budget > 0 => {
                *budget -= 1;
                true
            }
            _ => false,
        }
    }

    /// Remaining half-open budget, if the instance is half-open.
    pub fn half_open_budget(&self, instance_id: &str) -> Option<u32> {
        self.circuit.read().half_open.get(instance_id).copied()
    }

    pub fn subset_view(&self) -> SubsetStateView {
        self.subsets.read().clone()
    }

    pub fn publish_subsets(&self, view: SubsetStateView) {
        *self.subsets.write() = view;
    }

    pub fn dynamic_weight_version(&self) -> u64 {
        self.dynamic_weight_version.load(Ordering::Acquire)
    }

    pub fn bump_dynamic_weight_version(&self, sync_interval_ms: u64) -> u64 {
        self.dynamic_weight_sync_ms
            .store(sync_interval_ms, Ordering::Relaxed);
        self.dynamic_weight_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dynamic_weight_sync_ms(&self) -> u64 {
        self.dynamic_weight_sync_ms.load(Ordering::Relaxed)
    }
}

/// The instances view a request carries through the router chain to the
/// load balancer: the service entry (for side-band reads), the snapshot
/// whose refcount backs every exposed instance, and the current narrowed
/// set.
#[derive(Debug, Clone)]
pub struct ServiceInstances {
    service: Arc<Service>,
    data: Arc<ServiceData>,
    available: Arc<InstancesSet>,
}

impl ServiceInstances {
    /// Builds the view from an instances snapshot. Starts from the
    /// snapshot's stable available set so selector caches are shared across
    /// requests.
    pub fn new(service: Arc<Service>, data: Arc<ServiceData>) -> Option<Self> {
        if data.status() == DataStatus::NotFound {
            return None;
        }
        let available = data.instances()?.available().clone();
        Some(Self {
            service,
            data,
            available,
        })
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn data(&self) -> &Arc<ServiceData> {
        &self.data
    }

    pub fn available(&self) -> &Arc<InstancesSet> {
        &self.available
    }

    /// Replaces the working set after a router stage narrows it.
    pub fn narrow(&mut self, set: Arc<InstancesSet>) {
        self.available = set;
    }

    /// Circuit sets snapshot for filtering decisions.
    pub fn circuit(&self) -> CircuitView {
        self.service.circuit()
    }
}
