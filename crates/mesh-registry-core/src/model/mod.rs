//! Data model of the consumer runtime.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codes::{RegistryError, Result, ReturnCode};

mod instance;
pub mod rules;
mod service;
mod service_data;

pub use instance::{Instance, InstanceBuilder, LocalityPick};
pub use service::{CircuitState, CircuitView, Service, ServiceInstances, SubsetStateView};
pub use service_data::{
    DataKind, DataPayload, DataStatus, InstancesData, InstancesSet, Selector, ServiceData,
};

/// Identifies every cached entity: a `(namespace, name)` pair, both
/// non-empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Both components must be non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(RegistryError::with_detail(
                ReturnCode::InvalidArgument,
                "service namespace and name must be non-empty",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Source service identity plus request metadata, used by the rule router
/// to match outbound/inbound rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_key: Option<ServiceKey>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Three-level location of an instance or of the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub campus: String,
}

impl Location {
    pub fn new(
        region: impl Into<String>,
        zone: impl Into<String>,
        campus: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            zone: zone.into(),
            campus: campus.into(),
        }
    }
}

/// Outcome of one call to an instance, reported by the caller and consumed
/// by the circuit breakers and the locality-aware balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    Timeout,
    Error,
}

impl CallStatus {
    pub fn is_failure(self) -> bool {
        !matches!(self, CallStatus::Ok)
    }
}

/// Input bundle for load-balancer selection.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    /// 64-bit numeric hash key.
    pub hash_key: u64,
    /// Optional string to hash when `hash_key` is zero.
    pub hash_string: Option<String>,
    /// Skip the half-open probe gate entirely.
    pub ignore_half_open: bool,
    /// Advances the ring/table probe to produce an alternative pick on retry.
    pub replicate_index: usize,
}

/// Failover behaviour of the metadata router when no instance matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetadataFailover {
    /// Empty match result fails the route.
    #[default]
    None,
    /// Empty match result falls back to instances without the metadata key.
    NotKey,
    /// Empty match result falls back to all instances.
    All,
}
