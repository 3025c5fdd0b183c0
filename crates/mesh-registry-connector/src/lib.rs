//! Long-lived control-plane connector.
//!
//! One bidirectional discover stream multiplexes every `(service, kind)`
//! subscription. The run loop dials an endpoint, replays all pending
//! subscriptions with their last-known revisions, then serves pushes,
//! periodic polls and new subscriptions until the stream drops, at which
//! point every listener moves back to pending and the loop reconnects with
//! bounded exponential backoff, rotating endpoints on failure and on the
//! configured switch interval.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use mesh_registry_cache::{DiscoveryDriver, ServiceDataCache};
use mesh_registry_core::{
    clock, DataKind, RegistryError, Result, ReturnCode, ServiceKey,
};

pub mod memory;
pub mod timeout;
pub mod transport;

pub use timeout::TimeoutStrategy;
pub use transport::{
    DiscoverRequest, DiscoverResponse, DiscoverStream, DiscoverTransport, InstanceIdRequest,
    RegisterRequest,
};

/// Observer of per-endpoint call outcomes; the context feeds these into
/// the circuit breaker of the control plane's own service.
pub type EndpointObserver = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Bootstrap control-plane endpoints; also the seed instances of the
    /// self-hosting discover service.
    pub addresses: Vec<String>,
    pub protocol: String,
    pub connect_timeout_ms: u64,
    pub message_timeout_ms: u64,
    /// Periodic endpoint rotation, and the reconnect backoff ceiling.
    pub server_switch_interval_ms: u64,
    /// Default poll interval for subscribed keys.
    pub sync_interval_ms: u64,
    pub reconnect_base_ms: u64,
    /// Adaptive timeout expansion factor.
    pub timeout_expand: f64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            protocol: "grpc".to_string(),
            connect_timeout_ms: 500,
            message_timeout_ms: 1_000,
            server_switch_interval_ms: 600_000,
            sync_interval_ms: 2_000,
            reconnect_base_ms: 500,
            timeout_expand: 2.0,
        }
    }
}

enum Command {
    Subscribe(ServiceKey, DataKind),
    Unsubscribe(ServiceKey, DataKind),
}

/// The cache-facing subscription driver.
struct ConnectorDriver {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl DiscoveryDriver for ConnectorDriver {
    fn ensure_subscribed(&self, key: &ServiceKey, kind: DataKind) {
        let _ = self.cmd_tx.send(Command::Subscribe(key.clone(), kind));
    }

    fn unsubscribe(&self, key: &ServiceKey, kind: DataKind) {
        let _ = self.cmd_tx.send(Command::Unsubscribe(key.clone(), kind));
    }
}

pub struct ServerConnector {
    config: ConnectorConfig,
    transport: Arc<dyn DiscoverTransport>,
    cache: Arc<ServiceDataCache>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    endpoint_index: AtomicUsize,
    provider_timeout: Mutex<TimeoutStrategy>,
    observer: Mutex<Option<EndpointObserver>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ServerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnector")
            .field("config", &self.config)
            .field("endpoint_index", &self.endpoint_index)
            .finish()
    }
}

enum LoopAction {
    Idle,
    Shutdown,
    Reconnect,
    SendAll,
    Send(ServiceKey, DataKind),
}

impl ServerConnector {
    pub fn new(
        config: ConnectorConfig,
        transport: Arc<dyn DiscoverTransport>,
        cache: Arc<ServiceDataCache>,
    ) -> Result<Arc<Self>> {
        if config.addresses.is_empty() {
            return Err(RegistryError::with_detail(
                ReturnCode::SystemServiceNotConfigured,
                "no control plane addresses configured",
            ));
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let provider_timeout = TimeoutStrategy::new(
            config.message_timeout_ms / 2,
            config.message_timeout_ms * 4,
            config.timeout_expand,
        );
        Ok(Arc::new(Self {
            config,
            transport,
            cache,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            endpoint_index: AtomicUsize::new(0),
            provider_timeout: Mutex::new(provider_timeout),
            observer: Mutex::new(None),
            shutdown_tx,
        }))
    }

    /// The driver the cache calls into on first access / GC.
    pub fn driver(&self) -> Arc<dyn DiscoveryDriver> {
        Arc::new(ConnectorDriver {
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    pub fn set_endpoint_observer(&self, observer: EndpointObserver) {
        *self.observer.lock() = Some(observer);
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn current_endpoint(&self) -> String {
        let index = self.endpoint_index.load(Ordering::Relaxed);
        self.config.addresses[index % self.config.addresses.len()].clone()
    }

    fn rotate_endpoint(&self) {
        self.endpoint_index.fetch_add(1, Ordering::Relaxed);
    }

    fn observe(&self, endpoint: &str, success: bool) {
        if let Some(observer) = self.observer.lock().clone() {
            observer(endpoint, success);
        }
    }

    fn discover_request(&self, key: &ServiceKey, kind: DataKind) -> DiscoverRequest {
        let revision = self
            .cache
            .revision_of(key, kind, clock::coarse_now_ms())
            .unwrap_or_default();
        DiscoverRequest {
            key: key.clone(),
            kind,
            revision,
        }
    }

    fn handle_response(&self, response: DiscoverResponse) {
        let now_ms = clock::tick();
        match ReturnCode::from_u32(response.code) {
            ReturnCode::Ok => {
                let cached = self.cache.revision_of(&response.key, response.kind, now_ms);
                let unchanged = response.payload.is_none()
                    || cached.as_deref() == Some(response.revision.as_str());
                if unchanged {
                    self.cache
                        .touch_unchanged(&response.key, response.kind, now_ms);
                    return;
                }
                if let Some(payload) = response.payload {
                    self.cache.update(
                        &response.key,
                        response.kind,
                        Some((response.revision, payload)),
                        now_ms,
                    );
                }
            }
            ReturnCode::ServiceNotFound | ReturnCode::ResourceNotFound => {
                self.cache
                    .update(&response.key, response.kind, None, now_ms);
            }
            ReturnCode::InvalidArgument => {
                tracing::warn!(
                    service = %response.key,
                    kind = %response.kind,
                    "control plane rejected discover request"
                );
            }
            other => {
                tracing::warn!(
                    service = %response.key,
                    kind = %response.kind,
                    code = %other,
                    "unexpected discover response code"
                );
            }
        }
    }

    /// Drives the stream until shutdown. Owned by the context's reactor
    /// runtime.
    pub async fn run(self: Arc<Self>) {
        let Some(mut cmd_rx) = self.cmd_rx.lock().take() else {
            return;
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut subscriptions: HashSet<(ServiceKey, DataKind)> = HashSet::new();
        let mut backoff_ms = self.config.reconnect_base_ms.max(10);

        'reconnect: loop {
            if *shutdown_rx.borrow() {
                return;
            }
            let endpoint = self.current_endpoint();
            let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms.max(1));
            let connected = tokio::time::timeout(
                connect_timeout,
                self.transport.connect(&endpoint, connect_timeout),
            )
            .await;
            let mut stream = match connected {
                Ok(Ok(stream)) => {
                    tracing::info!(endpoint = %endpoint, "discover stream connected");
                    self.observe(&endpoint, true);
                    backoff_ms = self.config.reconnect_base_ms.max(10);
                    stream
                }
                Ok(Err(err)) => {
                    tracing::warn!(endpoint = %endpoint, error = %err, "connect failed");
                    self.observe(&endpoint, false);
                    self.rotate_endpoint();
                    if self.sleep_backoff(&mut backoff_ms, &mut shutdown_rx).await {
                        return;
                    }
                    continue 'reconnect;
                }
                Err(_) => {
                    tracing::warn!(endpoint = %endpoint, "connect timed out");
                    self.observe(&endpoint, false);
                    self.rotate_endpoint();
                    if self.sleep_backoff(&mut backoff_ms, &mut shutdown_rx).await {
                        return;
                    }
                    continue 'reconnect;
                }
            };

            // Replay every pending subscription with its cached revision.
            for (key, kind) in subscriptions.clone() {
                if stream.send(self.discover_request(&key, kind)).await.is_err() {
                    self.rotate_endpoint();
                    continue 'reconnect;
                }
            }

            let connected_at = clock::now_ms();
            let mut poll = tokio::time::interval(Duration::from_millis(
                self.config.sync_interval_ms.max(100),
            ));
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let action = tokio::select! {
                    _ = shutdown_rx.changed() => LoopAction::Shutdown,
                    command = cmd_rx.recv() => match command {
                        None => LoopAction::Shutdown,
                        Some(Command::Subscribe(key, kind)) => {
                            if subscriptions.insert((key.clone(), kind)) {
                                LoopAction::Send(key, kind)
                            } else {
                                LoopAction::Idle
                            }
                        }
                        Some(Command::Unsubscribe(key, kind)) => {
                            subscriptions.remove(&(key, kind));
                            LoopAction::Idle
                        }
                    },
                    _ = poll.tick() => {
                        if clock::now_ms().saturating_sub(connected_at)
                            >= self.config.server_switch_interval_ms
                        {
                            tracing::info!("switch interval elapsed, rotating endpoint");
                            self.rotate_endpoint();
                            LoopAction::Reconnect
                        } else {
                            LoopAction::SendAll
                        }
                    }
                    response = stream.recv() => match response {
                        Ok(Some(response)) => {
                            self.handle_response(response);
                            LoopAction::Idle
                        }
                        Ok(None) => {
                            tracing::warn!("discover stream closed by server");
                            LoopAction::Reconnect
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "discover stream failed");
                            self.observe(&self.current_endpoint(), false);
                            LoopAction::Reconnect
                        }
                    },
                };

                match action {
                    LoopAction::Idle => {}
                    LoopAction::Shutdown => return,
                    LoopAction::Reconnect => continue 'reconnect,
                    LoopAction::Send(key, kind) => {
                        if stream.send(self.discover_request(&key, kind)).await.is_err() {
                            continue 'reconnect;
                        }
                    }
                    LoopAction::SendAll => {
                        for (key, kind) in subscriptions.clone() {
                            if stream
                                .send(self.discover_request(&key, kind))
                                .await
                                .is_err()
                            {
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sleeps the jittered backoff; true means shutdown fired meanwhile.
    async fn sleep_backoff(
        &self,
        backoff_ms: &mut u64,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let jitter = rand::rng().random_range(0..=*backoff_ms / 4 + 1);
        let delay = Duration::from_millis(*backoff_ms + jitter);
        *backoff_ms = (*backoff_ms * 2).min(self.config.server_switch_interval_ms.max(1_000));
        tokio::select! {
            _ = shutdown_rx.changed() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn unary<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn DiscoverTransport>, String, Duration) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let endpoint = self.current_endpoint();
        let timeout = self.provider_timeout.lock().timeout();
        let started = clock::now_ms();
        let outcome = tokio::time::timeout(
            timeout,
            call(self.transport.clone(), endpoint.clone(), timeout),
        )
        .await;
        match outcome {
            Ok(Ok(value)) => {
                self.provider_timeout
                    .lock()
                    .on_success(clock::now_ms().saturating_sub(started));
                self.observe(&endpoint, true);
                Ok(value)
            }
            Ok(Err(err)) => {
                if err.code() == ReturnCode::NetworkFailed {
                    self.provider_timeout.lock().on_retry();
                    self.observe(&endpoint, false);
                    self.rotate_endpoint();
                }
                Err(err)
            }
            Err(_) => {
                self.provider_timeout.lock().on_retry();
                self.observe(&endpoint, false);
                self.rotate_endpoint();
                Err(RegistryError::with_detail(
                    ReturnCode::Timeout,
                    "control plane request timed out",
                ))
            }
        }
    }

    pub async fn register_instance(&self, request: RegisterRequest) -> Result<String> {
        self.unary(|transport, endpoint, timeout| async move {
            transport.register(&endpoint, request, timeout).await
        })
        .await
    }

    pub async fn deregister_instance(&self, request: InstanceIdRequest) -> Result<()> {
        self.unary(|transport, endpoint, timeout| async move {
            transport.deregister(&endpoint, request, timeout).await
        })
        .await
    }

    pub async fn heartbeat(&self, request: InstanceIdRequest) -> Result<()> {
        self.unary(|transport, endpoint, timeout| async move {
            transport.heartbeat(&endpoint, request, timeout).await
        })
        .await
    }

    pub async fn report_client(&self, host: &str, sdk_version: &str) {
        let endpoint = self.current_endpoint();
        if let Err(err) = self
            .transport
            .report_client(&endpoint, host, sdk_version)
            .await
        {
            tracing::debug!(error = %err, "client report failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryControlPlane, MemoryTransport};
    use mesh_registry_cache::{CacheConfig, InstanceRecord, SnapshotPayload};
    use mesh_registry_core::DataStatus;
    use std::collections::HashMap;
    use std::time::Duration;

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
        ServiceKey::new("X", "Y")
    }

    struct Harness {
        plane: Arc<InMemoryControlPlane>,
        cache: Arc<ServiceDataCache>,
        connector: Arc<ServerConnector>,
    }

    fn harness() -> Harness {
        let plane = InMemoryControlPlane::new();
        let transport = MemoryTransport::new(plane.clone());
        let cache = Arc::new(ServiceDataCache::new(CacheConfig::default()));
        let config = ConnectorConfig {
            addresses: vec!["mem-a:8091".to_string(), "mem-b:8091".to_string()],
            sync_interval_ms: 100,
            reconnect_base_ms: 20,
            ..Default::default()
        };
        let connector = ServerConnector::new(config, transport, cache.clone()).unwrap();
        cache.set_driver(connector.driver());
        Harness {
            plane,
            cache,
            connector,
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn empty_addresses_is_not_configured() {
        let plane = InMemoryControlPlane::new();
        let cache = Arc::new(ServiceDataCache::new(CacheConfig::default()));
        let err = ServerConnector::new(
            ConnectorConfig::default(),
            MemoryTransport::new(plane),
            cache,
        )
        .unwrap_err();
        assert_eq!(err.code(), ReturnCode::SystemServiceNotConfigured);
    }

    #[tokio::test]
    async fn subscribe_syncs_service_data() {
        let h = harness();
        h.plane
            .set_service(&key(), DataKind::Instances, "r1", payload(&["a", "b"]));
        let task = tokio::spawn(h.connector.clone().run());

        let notify = h
            .cache
            .load_with_notify(&key(), DataKind::Instances, clock::now_ms());
        assert!(notify.wait_ready(Duration::from_secs(2)).await);
        let (data, status) = h.cache.get(&key(), DataKind::Instances, clock::now_ms());
        assert_eq!(status, DataStatus::Syncing);
        assert_eq!(data.unwrap().instances().unwrap().instances().len(), 2);

        h.connector.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_service_marks_not_found() {
        let h = harness();
        let task = tokio::spawn(h.connector.clone().run());

        let notify = h
            .cache
            .load_with_notify(&key(), DataKind::Instances, clock::now_ms());
        assert!(notify.wait_ready(Duration::from_secs(2)).await);
        let (_, status) = h.cache.get(&key(), DataKind::Instances, clock::now_ms());
        assert_eq!(status, DataStatus::NotFound);

        h.connector.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn push_updates_subscribers() {
        let h = harness();
        let task = tokio::spawn(h.connector.clone().run());
        h.plane
            .set_service(&key(), DataKind::Instances, "r1", payload(&["a"]));
        h.cache
            .load_with_notify(&key(), DataKind::Instances, clock::now_ms());
        wait_for("first sync", || {
            h.cache
                .revision_of(&key(), DataKind::Instances, clock::now_ms())
                .is_some()
        })
        .await;

        h.plane
            .set_service(&key(), DataKind::Instances, "r2", payload(&["a", "b", "c"]));
        wait_for("pushed revision", || {
            h.cache
                .revision_of(&key(), DataKind::Instances, clock::now_ms())
                .as_deref()
                == Some("r2")
        })
        .await;

        h.connector.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stream_kill_resyncs_with_unchanged_revision() {
        let h = harness();
        let task = tokio::spawn(h.connector.clone().run());
        h.plane
            .set_service(&key(), DataKind::Instances, "r1", payload(&["a"]));
        h.cache
            .load_with_notify(&key(), DataKind::Instances, clock::now_ms());
        wait_for("first sync", || {
            h.cache
                .revision_of(&key(), DataKind::Instances, clock::now_ms())
                .is_some()
        })
        .await;
        let (before, _) = h.cache.get(&key(), DataKind::Instances, clock::now_ms());
        let before = before.unwrap();
        let version_before = before.cache_version();

        h.plane.kill_streams();
        // The reconnect resubscribes with revision r1; the server answers
        // "unchanged", so the snapshot pointer survives but freshness
        // advances.
        wait_for("cache touch after resync", || {
            before.cache_version() > version_before
        })
        .await;
        let (after, status) = h.cache.get(&key(), DataKind::Instances, clock::now_ms());
        assert_eq!(status, DataStatus::Syncing);
        assert!(Arc::ptr_eq(&before, &after.unwrap()));

        h.connector.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connects_rotate_and_retry() {
        let h = harness();
        h.plane.set_refuse_connects(true);
        let task = tokio::spawn(h.connector.clone().run());
        wait_for("multiple connect attempts", || h.plane.connect_count() >= 3).await;
        h.plane.set_refuse_connects(false);
        h.plane
            .set_service(&key(), DataKind::Instances, "r1", payload(&["a"]));
        let notify = h
            .cache
            .load_with_notify(&key(), DataKind::Instances, clock::now_ms());
        assert!(notify.wait_ready(Duration::from_secs(3)).await);

        h.connector.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn provider_round_trip() {
        let h = harness();
        let request = RegisterRequest {
            key: key(),
            host: "10.2.0.1".to_string(),
            port: 9000,
            protocol: "grpc".to_string(),
            version: "1.0".to_string(),
            weight: 100,
            priority: 0,
            metadata: HashMap::new(),
            location: Default::default(),
            ttl_s: Some(5),
        };
        let id = h.connector.register_instance(request.clone()).await.unwrap();
        assert_eq!(h.plane.registered_instances(), vec![id.clone()]);

        // Duplicate registration is surfaced as an existing resource.
        let err = h.connector.register_instance(request).await.unwrap_err();
        assert_eq!(err.code(), ReturnCode::ExistedResource);

        h.connector
            .heartbeat(InstanceIdRequest {
                key: key(),
                instance_id: id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(h.plane.heartbeat_count(&id), 1);

        h.connector
            .deregister_instance(InstanceIdRequest {
                key: key(),
                instance_id: id.clone(),
            })
            .await
            .unwrap();
        let err = h
            .connector
            .deregister_instance(InstanceIdRequest {
                key: key(),
                instance_id: id,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ReturnCode::ResourceNotFound);
    }

    #[tokio::test]
    async fn heartbeat_without_ttl_is_disabled() {
        let h = harness();
        let request = RegisterRequest {
            key: key(),
            host: "10.2.0.1".to_string(),
            port: 9000,
            protocol: String::new(),
            version: String::new(),
            weight: 100,
            priority: 0,
            metadata: HashMap::new(),
            location: Default::default(),
            ttl_s: None,
        };
        let id = h.connector.register_instance(request).await.unwrap();
        let err = h
            .connector
            .heartbeat(InstanceIdRequest {
                key: key(),
                instance_id: id,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ReturnCode::HealthCheckDisabled);
    }
}
