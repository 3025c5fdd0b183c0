//! Versioned registry of per-service data snapshots.
//!
//! The cache keeps one read-mostly map per data kind plus the long-lived
//! [`Service`] entries carrying circuit-breaker and dynamic-weight
//! side-bands. Updates publish immutable snapshots; replaced snapshots are
//! reclaimed after the RCU grace window. First-access subscribes through the
//! configured discovery driver and parks callers on a notification handle
//! until the first sync or timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use mesh_registry_core::{
    DataKind, DataStatus, RcuMap, Service, ServiceData, ServiceKey, SyncNotify,
};

pub mod persist;
pub mod snapshot;

pub use persist::SnapshotStore;
pub use snapshot::{InstanceRecord, SnapshotPayload};

/// Cache tuning knobs, fed from `consumer.localCache` configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Snapshot directory; `None` disables persistence.
    pub persist_dir: Option<PathBuf>,
    /// Idle period after which a subscribed service becomes a GC candidate.
    pub service_expire_ms: u64,
    /// Periodic re-discover interval hint handed to the connector.
    pub refresh_interval_ms: u64,
    /// Grace window before replaced snapshots are reclaimed.
    pub rcu_grace_ms: u64,
    /// How long a `NotFound` verdict is served before the next lookup may
    /// hit the server again.
    pub not_found_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persist_dir: None,
            service_expire_ms: 24 * 60 * 60 * 1000,
            refresh_interval_ms: 2_000,
            rcu_grace_ms: 2_000,
            not_found_ttl_ms: 60_000,
        }
    }
}

/// Seam to the server connector: the cache subscribes keys on first access
/// and unsubscribes before freeing a GC'd entry.
pub trait DiscoveryDriver: Send + Sync {
    fn ensure_subscribed(&self, key: &ServiceKey, kind: DataKind);
    fn unsubscribe(&self, key: &ServiceKey, kind: DataKind);
}

/// Hook invoked before a snapshot replacement is published.
pub type PreUpdateHook =
    Arc<dyn Fn(&ServiceKey, DataKind, Option<&Arc<ServiceData>>, &Arc<ServiceData>) + Send + Sync>;

fn kind_index(kind: DataKind) -> usize {
    match kind {
        DataKind::Instances => 0,
        DataKind::RouteRule => 1,
        DataKind::RateLimitRule => 2,
        DataKind::CircuitBreakerConfig => 3,
    }
}

pub struct ServiceDataCache {
    services: RcuMap<ServiceKey, Service>,
    maps: [RcuMap<ServiceKey, ServiceData>; 4],
    notifies: Mutex<HashMap<(ServiceKey, DataKind), Arc<SyncNotify>>>,
    hooks: RwLock<Vec<PreUpdateHook>>,
    driver: RwLock<Option<Arc<dyn DiscoveryDriver>>>,
    version: AtomicU64,
    store: Option<SnapshotStore>,
    not_found_ms: Mutex<HashMap<(ServiceKey, DataKind), u64>>,
    config: CacheConfig,
}

impl ServiceDataCache {
    pub fn new(config: CacheConfig) -> Self {
        let store = config
            .persist_dir
            .as_ref()
            .and_then(|dir| match SnapshotStore::open(dir) {
                Ok(store) => Some(store),
                Err(err) => {
                    tracing::warn!(error = %err, "snapshot store disabled");
                    None
                }
            });
        Self {
            services: RcuMap::new(),
            maps: [RcuMap::new(), RcuMap::new(), RcuMap::new(), RcuMap::new()],
            notifies: Mutex::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            driver: RwLock::new(None),
            version: AtomicU64::new(0),
            store,
            not_found_ms: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Wires the discovery driver; done once at context build time.
    pub fn set_driver(&self, driver: Arc<dyn DiscoveryDriver>) {
        *self.driver.write() = Some(driver);
    }

    pub fn add_pre_update_hook(&self, hook: PreUpdateHook) {
        self.hooks.write().push(hook);
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The long-lived side-band entry for a key, created on first access.
    pub fn service(&self, key: &ServiceKey, now_ms: u64) -> Arc<Service> {
        let entry = self
            .services
            .upsert_with(key.clone(), now_ms, || Arc::new(Service::new(key.clone(), now_ms)));
        entry.touch(now_ms);
        entry
    }

    /// Non-blocking snapshot read. `NotInit` when no subscription has
    /// produced data; a `NotFound` marker older than the negative TTL is
    /// reported as `NotInit` so the next load may consult the server again.
    pub fn get(
        &self,
        key: &ServiceKey,
        kind: DataKind,
        now_ms: u64,
    ) -> (Option<Arc<ServiceData>>, DataStatus) {
        self.service(key, now_ms);
        match self.maps[kind_index(kind)].get(key, now_ms) {
            Some(data) => {
                let status = data.status();
                if status == DataStatus::NotFound && self.not_found_expired(key, kind, now_ms) {
                    return (None, DataStatus::NotInit);
                }
                (Some(data), status)
            }
            None => (None, DataStatus::NotInit),
        }
    }

    fn not_found_expired(&self, key: &ServiceKey, kind: DataKind, now_ms: u64) -> bool {
        let marks = self.not_found_ms.lock();
        marks
            .get(&(key.clone(), kind))
            .is_some_and(|marked| marked.saturating_add(self.config.not_found_ttl_ms) <= now_ms)
    }

    /// Subscribes the key if needed and returns a handle the caller can
    /// wait on for first sync. The handle is pre-fired when data has
    /// already flowed (or the key is known missing).
    pub fn load_with_notify(
        &self,
        key: &ServiceKey,
        kind: DataKind,
        now_ms: u64,
    ) -> Arc<SyncNotify> {
        self.service(key, now_ms);
        if let Some(driver) = self.driver.read().clone() {
            driver.ensure_subscribed(key, kind);
        }
        let notify = {
            let mut notifies = self.notifies.lock();
            notifies
                .entry((key.clone(), kind))
                .or_insert_with(SyncNotify::new)
                .clone()
        };
        if let Some(data) = self.maps[kind_index(kind)].get(key, now_ms) {
            if matches!(data.status(), DataStatus::Syncing | DataStatus::NotFound) {
                notify.notify_ready();
            }
        }
        notify
    }

    fn fire_notify(&self, key: &ServiceKey, kind: DataKind) {
        if let Some(notify) = self.notifies.lock().get(&(key.clone(), kind)) {
            notify.notify_ready();
        }
    }

    /// Publishes a new snapshot. `None` marks the entry `NotFound` and
    /// removes the persisted file. A snapshot carrying the revision already
    /// cached (while synced) is a no-op for the cache version.
    pub fn update(
        &self,
        key: &ServiceKey,
        kind: DataKind,
        incoming: Option<(String, SnapshotPayload)>,
        now_ms: u64,
    ) -> Arc<ServiceData> {
        let map = &self.maps[kind_index(kind)];
        let old = map.get(key, now_ms);

        let new_data = match incoming {
            None => {
                self.not_found_ms
                    .lock()
                    .insert((key.clone(), kind), now_ms);
                if let Some(store) = &self.store {
                    store.remove(key, kind);
                }
                Arc::new(ServiceData::not_found(key.clone(), kind))
            }
            Some((revision, payload)) => {
                if let Some(existing) = &old {
                    if existing.status() == DataStatus::Syncing && existing.revision() == revision {
                        return existing.clone();
                    }
                }
                if let Some(store) = &self.store {
                    if let Err(err) = store.save(key, kind, &revision, &payload) {
                        tracing::warn!(service = %key, %kind, error = %err, "snapshot persist failed");
                    }
                }
                let previous_instances = old.as_ref().and_then(|data| data.instances());
                let payload = payload.into_payload(previous_instances);
                self.not_found_ms.lock().remove(&(key.clone(), kind));
                Arc::new(ServiceData::new(
                    key.clone(),
                    kind,
                    revision,
                    DataStatus::Syncing,
                    payload,
                ))
            }
        };

        new_data.set_cache_version(self.next_version());
        {
            let hooks = self.hooks.read();
            for hook in hooks.iter() {
                hook(key, kind, old.as_ref(), &new_data);
            }
        }
        map.update(key.clone(), new_data.clone(), now_ms);
        self.fire_notify(key, kind);
        tracing::debug!(
            service = %key,
            %kind,
            revision = new_data.revision(),
            status = ?new_data.status(),
            "service data updated"
        );
        new_data
    }

    /// Revision-unchanged reply: bumps the freshness version on the
    /// existing snapshot without republishing, and completes any waiters.
    pub fn touch_unchanged(&self, key: &ServiceKey, kind: DataKind, now_ms: u64) {
        if let Some(data) = self.maps[kind_index(kind)].get(key, now_ms) {
            data.set_cache_version(self.next_version());
            self.fire_notify(key, kind);
        }
    }

    /// Loads persisted snapshots as cold-start fallbacks.
    pub fn load_from_disk(&self, now_ms: u64) {
        let Some(store) = &self.store else {
            return;
        };
        for (key, kind, revision, payload) in store.load_all() {
            let data = Arc::new(ServiceData::new(
                key.clone(),
                kind,
                revision,
                DataStatus::LoadedFromDisk,
                payload.into_payload(None),
            ));
            data.set_cache_version(self.next_version());
            self.maps[kind_index(kind)].update(key.clone(), data, now_ms);
            tracing::info!(service = %key, %kind, "loaded snapshot from disk");
        }
    }

    /// Current revision to echo in a discover request.
    pub fn revision_of(&self, key: &ServiceKey, kind: DataKind, now_ms: u64) -> Option<String> {
        self.maps[kind_index(kind)]
            .get(key, now_ms)
            // Disk fallbacks resubscribe from scratch.
            .filter(|data| data.status() == DataStatus::Syncing)
            .map(|data| data.revision().to_string())
    }

    /// Applies dynamic weights to the current instances snapshot and bumps
    /// the side-band version. Snapshot replacement is not involved.
    pub fn update_dynamic_weights(
        &self,
        key: &ServiceKey,
        weights: &HashMap<String, u32>,
        sync_interval_ms: u64,
        now_ms: u64,
    ) {
        let Some(data) = self.maps[kind_index(DataKind::Instances)].get(key, now_ms) else {
            return;
        };
        let Some(instances) = data.instances() else {
            return;
        };
        for (id, weight) in weights {
            if let Some(instance) = instances.find(id) {
                instance.set_dynamic_weight(*weight);
            }
        }
        self.service(key, now_ms)
            .bump_dynamic_weight_version(sync_interval_ms);
    }

    pub fn list_keys(&self, kind: DataKind) -> Vec<ServiceKey> {
        self.maps[kind_index(kind)].keys()
    }

    /// Expires services idle past the configured period. Unsubscribes from
    /// the control plane before the entries are freed.
    pub fn gc_expired(&self, now_ms: u64) -> Vec<ServiceKey> {
        let min_access = now_ms.saturating_sub(self.config.service_expire_ms);
        let mut expired = Vec::new();
        for service in self.services.values() {
            if service.last_access_ms() <= min_access {
                expired.push(service.key().clone());
            }
        }
        let driver = self.driver.read().clone();
        for key in &expired {
            for kind in DataKind::ALL {
                if let Some(driver) = &driver {
                    driver.unsubscribe(key, kind);
                }
                self.maps[kind_index(kind)].remove(key, now_ms);
                self.notifies.lock().remove(&(key.clone(), kind));
                self.not_found_ms.lock().remove(&(key.clone(), kind));
            }
            self.services.remove(key, now_ms);
            tracing::info!(service = %key, "expired idle service from cache");
        }
        expired
    }

    /// Reclaims snapshots whose grace window has elapsed. Runs on the
    /// scheduler.
    pub fn run_rcu_gc(&self, now_ms: u64) {
        let min_delete = now_ms.saturating_sub(self.config.rcu_grace_ms);
        for map in &self.maps {
            map.check_gc(min_delete);
        }
        self.services.check_gc(min_delete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn payload(ids: &[&str]) -> SnapshotPayload {
        SnapshotPayload::Instances {
            metadata: HashMap::new(),
            instances: ids
                .iter()
                .enumerate()
                .map(|(i, id)| InstanceRecord::new(*id, "10.1.0.1", 8000 + i as u16))
                .collect(),
        }
    }

    fn key() -> ServiceKey {
        ServiceKey::new("Test", "echo")
    }

    #[derive(Default)]
    struct RecordingDriver {
        subscribed: PlMutex<Vec<(ServiceKey, DataKind)>>,
        unsubscribed: PlMutex<Vec<(ServiceKey, DataKind)>>,
    }

    impl DiscoveryDriver for RecordingDriver {
        fn ensure_subscribed(&self, key: &ServiceKey, kind: DataKind) {
            self.subscribed.lock().push((key.clone(), kind));
        }
        fn unsubscribe(&self, key: &ServiceKey, kind: DataKind) {
            self.unsubscribed.lock().push((key.clone(), kind));
        }
    }

    #[test]
    fn get_before_any_subscription_is_not_init() {
        let cache = ServiceDataCache::new(CacheConfig::default());
        let (data, status) = cache.get(&key(), DataKind::Instances, 10);
        assert!(data.is_none());
        assert_eq!(status, DataStatus::NotInit);
    }

    #[test]
    fn update_publishes_and_bumps_version() {
        let cache = ServiceDataCache::new(CacheConfig::default());
        let first = cache.update(
            &key(),
            DataKind::Instances,
            Some(("r1".into(), payload(&["a"]))),
            10,
        );
        assert_eq!(first.status(), DataStatus::Syncing);
        let v1 = first.cache_version();
        let second = cache.update(
            &key(),
            DataKind::Instances,
            Some(("r2".into(), payload(&["a", "b"]))),
            20,
        );
        assert!(second.cache_version() > v1);
        let (data, status) = cache.get(&key(), DataKind::Instances, 21);
        assert_eq!(status, DataStatus::Syncing);
        assert_eq!(data.unwrap().instances().unwrap().instances().len(), 2);
    }

    #[test]
    fn same_revision_update_is_noop_for_version() {
        let cache = ServiceDataCache::new(CacheConfig::default());
        let first = cache.update(
            &key(),
            DataKind::Instances,
            Some(("r1".into(), payload(&["a"]))),
            10,
        );
        let version = first.cache_version();
        let again = cache.update(
            &key(),
            DataKind::Instances,
            Some(("r1".into(), payload(&["a"]))),
            20,
        );
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.cache_version(), version);
    }

    #[test]
    fn touch_unchanged_bumps_version_without_republish() {
        let cache = ServiceDataCache::new(CacheConfig::default());
        let first = cache.update(
            &key(),
            DataKind::Instances,
            Some(("r1".into(), payload(&["a"]))),
            10,
        );
        let version = first.cache_version();
        cache.touch_unchanged(&key(), DataKind::Instances, 20);
        let (data, _) = cache.get(&key(), DataKind::Instances, 21);
        let data = data.unwrap();
        assert!(Arc::ptr_eq(&first, &data));
        assert!(data.cache_version() > version);
    }

    #[test]
    fn none_update_marks_not_found_until_ttl() {
        let mut config = CacheConfig::default();
        config.not_found_ttl_ms = 100;
        let cache = ServiceDataCache::new(config);
        cache.update(&key(), DataKind::Instances, None, 10);
        let (_, status) = cache.get(&key(), DataKind::Instances, 50);
        assert_eq!(status, DataStatus::NotFound);
        let (data, status) = cache.get(&key(), DataKind::Instances, 200);
        assert!(data.is_none());
        assert_eq!(status, DataStatus::NotInit);
    }

    #[tokio::test]
    async fn load_with_notify_subscribes_and_fires_on_update() {
        let cache = ServiceDataCache::new(CacheConfig::default());
        let driver = Arc::new(RecordingDriver::default());
        cache.set_driver(driver.clone());

        let notify = cache.load_with_notify(&key(), DataKind::Instances, 10);
        assert!(!notify.is_ready());
        assert_eq!(driver.subscribed.lock().len(), 1);

        cache.update(
            &key(),
            DataKind::Instances,
            Some(("r1".into(), payload(&["a"]))),
            20,
        );
        assert!(notify.wait_ready(std::time::Duration::from_millis(10)).await);
    }

    #[test]
    fn pre_update_hooks_see_old_and_new() {
        let cache = ServiceDataCache::new(CacheConfig::default());
        let seen: Arc<PlMutex<Vec<(Option<String>, String)>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        cache.add_pre_update_hook(Arc::new(move |_, _, old, new| {
            sink.lock().push((
                old.map(|d| d.revision().to_string()),
                new.revision().to_string(),
            ));
        }));
        cache.update(
            &key(),
            DataKind::RouteRule,
            Some((
                "r1".into(),
                SnapshotPayload::RouteRule(Default::default()),
            )),
            10,
        );
        cache.update(
            &key(),
            DataKind::RouteRule,
            Some((
                "r2".into(),
                SnapshotPayload::RouteRule(Default::default()),
            )),
            20,
        );
        let seen = seen.lock();
        assert_eq!(seen[0], (None, "r1".to_string()));
        assert_eq!(seen[1], (Some("r1".to_string()), "r2".to_string()));
    }

    #[test]
    fn gc_unsubscribes_before_freeing() {
        let mut config = CacheConfig::default();
        config.service_expire_ms = 100;
        let cache = ServiceDataCache::new(config);
        let driver = Arc::new(RecordingDriver::default());
        cache.set_driver(driver.clone());

        cache.update(
            &key(),
            DataKind::Instances,
            Some(("r1".into(), payload(&["a"]))),
            10,
        );
        cache.get(&key(), DataKind::Instances, 10);

        let expired = cache.gc_expired(500);
        assert_eq!(expired, vec![key()]);
        assert!(!driver.unsubscribed.lock().is_empty());
        let (data, status) = cache.get(&key(), DataKind::Instances, 501);
        assert!(data.is_none());
        assert_eq!(status, DataStatus::NotInit);
    }

    #[test]
    fn dynamic_weights_apply_without_new_snapshot() {
        let cache = ServiceDataCache::new(CacheConfig::default());
        let data = cache.update(
            &key(),
            DataKind::Instances,
            Some(("r1".into(), payload(&["a"]))),
            10,
        );
        let weights = HashMap::from([("a".to_string(), 42u32)]);
        cache.update_dynamic_weights(&key(), &weights, 1000, 20);
        let instance = data.instances().unwrap().find("a").unwrap();
        assert_eq!(instance.dynamic_weight(), 42);
        assert_eq!(cache.service(&key(), 20).dynamic_weight_version(), 1);
    }

    #[test]
    fn disk_round_trip_restores_as_loaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::default();
        config.persist_dir = Some(dir.path().to_path_buf());
        {
            let cache = ServiceDataCache::new(config.clone());
            cache.update(
                &key(),
                DataKind::Instances,
                Some(("r9".into(), payload(&["a", "b"]))),
                10,
            );
        }
        let cache = ServiceDataCache::new(config);
        cache.load_from_disk(10);
        let (data, status) = cache.get(&key(), DataKind::Instances, 11);
        assert_eq!(status, DataStatus::LoadedFromDisk);
        assert_eq!(data.unwrap().instances().unwrap().instances().len(), 2);
        // Disk fallbacks never echo a revision to the server.
        assert_eq!(cache.revision_of(&key(), DataKind::Instances, 12), None);
    }
}
