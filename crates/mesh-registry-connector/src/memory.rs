//! In-memory control plane.
//!
//! A full-fidelity transport for tests and demos: revision-tracked pushes,
//! no-change replies, `NotFound` verdicts, provider registration with
//! heartbeat TTLs, and fault hooks to kill streams or refuse connects.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use mesh_registry_cache::SnapshotPayload;
use mesh_registry_core::{
    DataKind, RegistryError, Result, ReturnCode, ServiceKey,
};

use crate::transport::{
    DiscoverRequest, DiscoverResponse, DiscoverStream, DiscoverTransport, InstanceIdRequest,
    RegisterRequest,
};

#[derive(Default)]
struct PlaneState {
    data: HashMap<(ServiceKey, DataKind), (String, SnapshotPayload)>,
    streams: Vec<StreamHandle>,
    registered: HashMap<String, RegisterRequest>,
    heartbeats: Vec<String>,
}

struct StreamHandle {
    tx: mpsc::UnboundedSender<DiscoverResponse>,
    subscriptions: Arc<Mutex<HashSet<(ServiceKey, DataKind)>>>,
}

/// Shared in-memory control plane; clone the `Arc` into the transport.
#[derive(Default)]
pub struct InMemoryControlPlane {
    state: Mutex<PlaneState>,
    refuse_connects: AtomicBool,
    connect_count: AtomicU64,
    next_instance_id: AtomicU64,
}

impl InMemoryControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes (or replaces) a snapshot and pushes it to subscribers.
    pub fn set_service(
        &self,
        key: &ServiceKey,
        kind: DataKind,
        revision: &str,
        payload: SnapshotPayload,
    ) {
        let mut state = self.state.lock();
        state
            .data
            .insert((key.clone(), kind), (revision.to_string(), payload.clone()));
        let response = DiscoverResponse {
            code: ReturnCode::Ok.as_u32(),
            key: key.clone(),
            kind,
            revision: revision.to_string(),
            payload: Some(payload),
        };
        state.streams.retain(|stream| {
            if !stream.subscriptions.lock().contains(&(key.clone(), kind)) {
                return !stream.tx.is_closed();
            }
            stream.tx.send(response.clone()).is_ok()
        });
    }

    /// Removes a service; subscribers learn on their next poll.
    pub fn remove_service(&self, key: &ServiceKey, kind: DataKind) {
        self.state.lock().data.remove(&(key.clone(), kind));
    }

    /// Severs every live stream, as a control-plane restart would.
    pub fn kill_streams(&self) {
        self.state.lock().streams.clear();
    }

    pub fn set_refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn registered_instances(&self) -> Vec<String> {
        self.state.lock().registered.keys().cloned().collect()
    }

    pub fn heartbeat_count(&self, instance_id: &str) -> usize {
        self.state
            .lock()
            .heartbeats
            .iter()
            .filter(|id| id.as_str() == instance_id)
            .count()
    }

    pub fn registered_ttl(&self, instance_id: &str) -> Option<Option<u32>> {
        self.state
            .lock()
            .registered
            .get(instance_id)
            .map(|request| request.ttl_s)
    }

    fn answer(&self, request: &DiscoverRequest) -> DiscoverResponse {
        let state = self.state.lock();
        match state.data.get(&(request.key.clone(), request.kind)) {
            Some((revision, payload)) => {
                if *revision == request.revision && !request.revision.is_empty() {
                    // Unchanged: echo the revision without a payload.
                    DiscoverResponse {
                        code: ReturnCode::Ok.as_u32(),
                        key: request.key.clone(),
                        kind: request.kind,
                        revision: revision.clone(),
                        payload: None,
                    }
                } else {
                    DiscoverResponse {
                        code: ReturnCode::Ok.as_u32(),
                        key: request.key.clone(),
                        kind: request.kind,
                        revision: revision.clone(),
                        payload: Some(payload.clone()),
                    }
                }
            }
            None => DiscoverResponse {
                code: ReturnCode::ServiceNotFound.as_u32(),
                key: request.key.clone(),
                kind: request.kind,
                revision: String::new(),
                payload: None,
            },
        }
    }
}

pub struct MemoryStream {
    plane: Arc<InMemoryControlPlane>,
    rx: mpsc::UnboundedReceiver<DiscoverResponse>,
    loopback: mpsc::UnboundedSender<DiscoverResponse>,
    subscriptions: Arc<Mutex<HashSet<(ServiceKey, DataKind)>>>,
}

#[async_trait]
impl DiscoverStream for MemoryStream {
    async fn send(&mut self, request: DiscoverRequest) -> Result<()> {
        self.subscriptions
            .lock()
            .insert((request.key.clone(), request.kind));
        let response = self.plane.answer(&request);
        self.loopback.send(response).map_err(|_| {
            RegistryError::with_detail(ReturnCode::NetworkFailed, "stream closed")
        })?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<DiscoverResponse>> {
        Ok(self.rx.recv().await)
    }
}

/// The transport side handed to the connector.
pub struct MemoryTransport {
    plane: Arc<InMemoryControlPlane>,
}

impl MemoryTransport {
    pub fn new(plane: Arc<InMemoryControlPlane>) -> Arc<Self> {
        Arc::new(Self { plane })
    }
}

#[async_trait]
impl DiscoverTransport for MemoryTransport {
    async fn connect(
        &self,
        _endpoint: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn DiscoverStream>> {
        self.plane.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.plane.refuse_connects.load(Ordering::SeqCst) {
            return Err(RegistryError::with_detail(
                ReturnCode::NetworkFailed,
                "connection refused",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        self.plane.state.lock().streams.push(StreamHandle {
            tx: tx.clone(),
            subscriptions: subscriptions.clone(),
        });
        Ok(Box::new(MemoryStream {
            plane: self.plane.clone(),
            rx,
            loopback: tx,
            subscriptions,
        }))
    }

    async fn register(
        &self,
        _endpoint: &str,
        request: RegisterRequest,
        _timeout: Duration,
    ) -> Result<String> {
        let mut state = self.plane.state.lock();
        let exists = state
            .registered
            .values()
            .any(|r| r.key == request.key && r.host == request.host && r.port == request.port);
        if exists {
            return Err(RegistryError::with_detail(
                ReturnCode::ExistedResource,
                "instance already registered",
            ));
        }
        let id = format!(
            "mem-{}",
            self.plane.next_instance_id.fetch_add(1, Ordering::SeqCst)
        );
        state.registered.insert(id.clone(), request);
        Ok(id)
    }

    async fn deregister(
        &self,
        _endpoint: &str,
        request: InstanceIdRequest,
        _timeout: Duration,
    ) -> Result<()> {
        let mut state = self.plane.state.lock();
        if state.registered.remove(&request.instance_id).is_none() {
            return Err(RegistryError::new(ReturnCode::ResourceNotFound));
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        _endpoint: &str,
        request: InstanceIdRequest,
        _timeout: Duration,
    ) -> Result<()> {
        let mut state = self.plane.state.lock();
        let Some(registered) = state.registered.get(&request.instance_id) else {
            return Err(RegistryError::new(ReturnCode::ResourceNotFound));
        };
        if registered.ttl_s.is_none() {
            return Err(RegistryError::new(ReturnCode::HealthCheckDisabled));
        }
        state.heartbeats.push(request.instance_id);
        Ok(())
    }

    async fn report_client(&self, _endpoint: &str, _host: &str, _sdk_version: &str) -> Result<()> {
        Ok(())
    }
}
