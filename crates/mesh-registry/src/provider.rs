//! Provider facade: register, deregister and heartbeat, with bounded
//! retry on transient failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mesh_registry_connector::{InstanceIdRequest, RegisterRequest};
use mesh_registry_core::{
    clock, Location, RegistryError, Result, ReturnCode, ServiceKey,
};

use crate::context::Context;
use crate::stat::ApiKind;

#[derive(Debug, Clone)]
pub struct InstanceRegisterRequest {
    pub service_key: ServiceKey,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub version: String,
    pub weight: u32,
    pub priority: u32,
    pub metadata: HashMap<String, String>,
    pub location: Location,
    /// Heartbeat TTL in seconds; `None` disables server-side health
    /// checking for the instance.
    pub ttl_s: Option<u32>,
}

impl InstanceRegisterRequest {
    pub fn new(service_key: ServiceKey, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_key,
            host: host.into(),
            port,
            protocol: String::new(),
            version: String::new(),
            weight: 100,
            priority: 0,
            metadata: HashMap::new(),
            location: Location::default(),
            ttl_s: None,
        }
    }
}

pub struct ProviderApi {
    context: Arc<Context>,
}

impl ProviderApi {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let config = &self.context.config().api;
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < config.max_retry_times => {
                    attempt += 1;
                    tracing::warn!(error = %err, attempt, "provider call retrying");
                    tokio::time::sleep(Duration::from_millis(config.retry_interval.max(1))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn record(&self, api: ApiKind, started_ms: u64, code: ReturnCode) {
        self.context
            .stats()
            .record(api, code, clock::now_ms().saturating_sub(started_ms));
    }

    /// Registers an instance and returns its server-assigned id.
    pub async fn register(&self, request: InstanceRegisterRequest) -> Result<String> {
        let started = clock::now_ms();
        let result = self.register_inner(request).await;
        let code = result.as_ref().map(|_| ReturnCode::Ok).unwrap_or_else(|e| e.code());
        self.record(ApiKind::Register, started, code);
        result
    }

    async fn register_inner(&self, request: InstanceRegisterRequest) -> Result<String> {
        request.service_key.validate()?;
        if request.host.is_empty() || request.port == 0 {
            return Err(RegistryError::with_detail(
                ReturnCode::InvalidArgument,
                "host and port must be set",
            ));
        }
        let wire = RegisterRequest {
            key: request.service_key,
            host: request.host,
            port: request.port,
            protocol: request.protocol,
            version: request.version,
            weight: request.weight.min(1000),
            priority: request.priority,
            metadata: request.metadata,
            location: request.location,
            ttl_s: request.ttl_s,
        };
        self.with_retry(|| {
            let wire = wire.clone();
            async move { self.context.connector().register_instance(wire).await }
        })
        .await
    }

    /// Removes an instance. Already-gone instances are treated as
    /// successfully deregistered.
    pub async fn deregister(&self, service_key: ServiceKey, instance_id: String) -> Result<()> {
        let started = clock::now_ms();
        let result = self.deregister_inner(service_key, instance_id).await;
        let code = result.as_ref().map(|_| ReturnCode::Ok).unwrap_or_else(|e| e.code());
        self.record(ApiKind::Deregister, started, code);
        result
    }

    async fn deregister_inner(&self, service_key: ServiceKey, instance_id: String) -> Result<()> {
        service_key.validate()?;
        if instance_id.is_empty() {
            return Err(RegistryError::with_detail(
                ReturnCode::InvalidArgument,
                "instance id must be non-empty",
            ));
        }
        let outcome = self
            .with_retry(|| {
                let request = InstanceIdRequest {
                    key: service_key.clone(),
                    instance_id: instance_id.clone(),
                };
                async move { self.context.connector().deregister_instance(request).await }
            })
            .await;
        match outcome {
            Err(err) if err.code() == ReturnCode::ResourceNotFound => Ok(()),
            other => other,
        }
    }

    /// Reports liveness for a TTL-registered instance.
    pub async fn heartbeat(&self, service_key: ServiceKey, instance_id: String) -> Result<()> {
        let started = clock::now_ms();
        let result = self.heartbeat_inner(service_key, instance_id).await;
        let code = result.as_ref().map(|_| ReturnCode::Ok).unwrap_or_else(|e| e.code());
        self.record(ApiKind::Heartbeat, started, code);
        result
    }

    async fn heartbeat_inner(&self, service_key: ServiceKey, instance_id: String) -> Result<()> {
        service_key.validate()?;
        if instance_id.is_empty() {
            return Err(RegistryError::with_detail(
                ReturnCode::InvalidArgument,
                "instance id must be non-empty",
            ));
        }
        self.with_retry(|| {
            let request = InstanceIdRequest {
                key: service_key.clone(),
                instance_id: instance_id.clone(),
            };
            async move { self.context.connector().heartbeat(request).await }
        })
        .await
    }
}
