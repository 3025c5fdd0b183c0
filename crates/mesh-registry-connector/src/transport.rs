//! Transport seam to the control plane.
//!
//! The wire encoding is owned by the embedding transport; this module
//! fixes only the shapes: a bidirectional discover stream multiplexing
//! `(service, kind)` subscriptions, and the unary provider calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use mesh_registry_cache::SnapshotPayload;
use mesh_registry_core::{DataKind, Location, Result, ServiceKey};

/// One subscription (or poll) sent over the discover stream, echoing the
/// locally cached revision.
#[derive(Debug, Clone)]
pub struct DiscoverRequest {
    pub key: ServiceKey,
    pub kind: DataKind,
    pub revision: String,
}

/// One push received from the discover stream. An empty payload with the
/// echoed revision means "no change"; `code` uses the server taxonomy and
/// is translated via `ReturnCode::from_u32`.
#[derive(Debug, Clone)]
pub struct DiscoverResponse {
    pub code: u32,
    pub key: ServiceKey,
    pub kind: DataKind,
    pub revision: String,
    pub payload: Option<SnapshotPayload>,
}

/// An established discover stream.
#[async_trait]
pub trait DiscoverStream: Send {
    async fn send(&mut self, request: DiscoverRequest) -> Result<()>;

    /// `Ok(None)` means the stream closed cleanly; the connector
    /// reconnects either way.
    async fn recv(&mut self) -> Result<Option<DiscoverResponse>>;
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub key: ServiceKey,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub version: String,
    pub weight: u32,
    pub priority: u32,
    pub metadata: HashMap<String, String>,
    pub location: Location,
    /// Heartbeat TTL in seconds; `None` registers without health checks.
    pub ttl_s: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct InstanceIdRequest {
    pub key: ServiceKey,
    pub instance_id: String,
}

#[async_trait]
pub trait DiscoverTransport: Send + Sync {
    /// Dials one control-plane endpoint and establishes the stream.
    async fn connect(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DiscoverStream>>;

    async fn register(
        &self,
        endpoint: &str,
        request: RegisterRequest,
        timeout: Duration,
    ) -> Result<String>;

    async fn deregister(
        &self,
        endpoint: &str,
        request: InstanceIdRequest,
        timeout: Duration,
    ) -> Result<()>;

    async fn heartbeat(
        &self,
        endpoint: &str,
        request: InstanceIdRequest,
        timeout: Duration,
    ) -> Result<()>;

    /// Periodic one-way client report; failures are logged, not surfaced.
    async fn report_client(&self, endpoint: &str, host: &str, sdk_version: &str) -> Result<()>;
}
