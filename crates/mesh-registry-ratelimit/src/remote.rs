//! Limiter-cluster reconciliation seam.
//!
//! The wire protocol is owned by the embedding transport; the quota
//! manager only pushes accumulated `(allowed, limited)` deltas and applies
//! the approved tokens it gets back.

use async_trait::async_trait;

use mesh_registry_core::{Result, ServiceKey};

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub service_key: ServiceKey,
    pub rule_id: String,
    pub label_key: String,
    pub allowed_delta: u64,
    pub limited_delta: u64,
}

#[derive(Debug, Clone)]
pub struct ReconcileResponse {
    /// Tokens the cluster approves for the window's next cycle.
    pub approved_remaining: u64,
}

#[async_trait]
pub trait LimitTransport: Send + Sync {
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResponse>;
}
