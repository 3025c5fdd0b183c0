//! Client runtime of a service mesh registry.
//!
//! Embed a [`Context`] to discover healthy backend instances of a named
//! service, route and balance requests across them, register the local
//! process as a provider, and acquire rate-limit quota:
//!
//! ```no_run
//! use std::sync::Arc;
//! use mesh_registry::{Config, Context, GetOneInstanceRequest, ServiceKey};
//! # use mesh_registry_connector::memory::{InMemoryControlPlane, MemoryTransport};
//!
//! # async fn example() -> mesh_registry::Result<()> {
//! let mut config = Config::default();
//! config.global.server_connector.addresses = vec!["10.0.0.1:8091".into()];
//! # let transport = MemoryTransport::new(InMemoryControlPlane::new());
//! let context = Context::create(config, transport)?;
//!
//! let consumer = context.consumer();
//! let request = GetOneInstanceRequest::new(ServiceKey::new("Test", "echo"));
//! let instance = consumer.get_one_instance(&request).await?;
//! println!("-> {}:{}", instance.host(), instance.port());
//! # Ok(())
//! # }
//! ```
//!
//! The heavy lifting lives in the concern crates: `mesh-registry-cache`
//! (versioned service-data cache), `mesh-registry-connector` (discover
//! stream), `mesh-registry-router` (filter chain), `mesh-registry-balance`
//! (pick policies), `mesh-registry-breaker` (circuit breaking),
//! `mesh-registry-healthcheck` (active probing) and
//! `mesh-registry-ratelimit` (quota windows). This crate wires them into
//! one runtime and exposes the consumer / provider / limit facades.

pub mod config;
pub mod consumer;
pub mod context;
pub mod limit;
pub mod provider;
pub mod stat;

pub use config::Config;
pub use consumer::{
    ConsumerApi, GetInstancesRequest, GetOneInstanceRequest, InstancesResponse, ServiceCallResult,
};
pub use context::Context;
pub use limit::LimitApi;
pub use provider::{InstanceRegisterRequest, ProviderApi};
pub use stat::{ApiKind, ApiStatRegistry};

pub use mesh_registry_core::{
    CallStatus, CircuitState, Criteria, DataKind, DataStatus, Instance, Location, LocalityPick,
    MetadataFailover, RegistryError, Result, ReturnCode, ServiceInfo, ServiceKey,
};
pub use mesh_registry_ratelimit::{
    LimitCallResult, QuotaRequest, QuotaResponse, QuotaResultInfo, QuotaVerdict,
};
