//! Serde mirror of a service-data snapshot, shared by the persistence layer
//! and the discover transport.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mesh_registry_core::model::rules::{CircuitBreakerConfigData, RateLimitData, RouteRuleData};
use mesh_registry_core::{DataKind, DataPayload, Instance, InstancesData, Location};

/// Plain-data form of one instance, as carried on the wire and on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub isolate: bool,
}

fn default_weight() -> u32 {
    100
}

fn default_healthy() -> bool {
    true
}

impl InstanceRecord {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: 100,
            priority: 0,
            protocol: String::new(),
            version: String::new(),
            metadata: HashMap::new(),
            location: Location::default(),
            healthy: true,
            isolate: false,
        }
    }

    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            id: instance.id().to_string(),
            host: instance.host().to_string(),
            port: instance.port(),
            weight: instance.weight(),
            priority: instance.priority(),
            protocol: instance.protocol().to_string(),
            version: instance.version().to_string(),
            metadata: instance.metadata().clone(),
            location: instance.location().clone(),
            healthy: instance.is_healthy(),
            isolate: instance.is_isolated(),
        }
    }

    pub fn into_instance(self) -> Instance {
        Instance::builder(self.id, self.host, self.port)
            .weight(self.weight)
            .priority(self.priority)
            .protocol(self.protocol)
            .version(self.version)
            .metadata(self.metadata)
            .location(self.location)
            .healthy(self.healthy)
            .isolate(self.isolate)
            .build()
    }

    /// Whether an existing shared instance can be kept for this record. A
    /// match preserves the process-local id across refreshes.
    pub fn matches(&self, instance: &Instance) -> bool {
        self.id == instance.id()
            && self.host == instance.host()
            && self.port == instance.port()
            && self.weight == instance.weight()
            && self.priority == instance.priority()
            && self.protocol == instance.protocol()
            && self.version == instance.version()
            && self.metadata == *instance.metadata()
            && self.location == *instance.location()
            && self.healthy == instance.is_healthy()
            && self.isolate == instance.is_isolated()
    }
}

/// Plain-data payload of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SnapshotPayload {
    Instances {
        #[serde(default)]
        metadata: HashMap<String, String>,
        instances: Vec<InstanceRecord>,
    },
    RouteRule(RouteRuleData),
    RateLimitRule(RateLimitData),
    CircuitBreakerConfig(CircuitBreakerConfigData),
}

impl SnapshotPayload {
    pub fn kind(&self) -> DataKind {
        match self {
            SnapshotPayload::Instances { .. } => DataKind::Instances,
            SnapshotPayload::RouteRule(_) => DataKind::RouteRule,
            SnapshotPayload::RateLimitRule(_) => DataKind::RateLimitRule,
            SnapshotPayload::CircuitBreakerConfig(_) => DataKind::CircuitBreakerConfig,
        }
    }

    /// Builds the runtime payload. For instances, shared `Arc<Instance>`s
    /// from the previous snapshot are reused when unchanged so the
    /// process-local id survives refreshes.
    pub fn into_payload(self, previous: Option<&InstancesData>) -> DataPayload {
        match self {
            SnapshotPayload::Instances {
                metadata,
                instances,
            } => {
                let shared = instances
                    .into_iter()
                    .map(|record| {
                        if let Some(prev) = previous.and_then(|p| p.find(&record.id)) {
                            if record.matches(prev) {
                                return prev.clone();
                            }
                        }
                        Arc::new(record.into_instance())
                    })
                    .collect();
                DataPayload::Instances(InstancesData::from_shared(shared, metadata))
            }
            SnapshotPayload::RouteRule(data) => DataPayload::RouteRule(data),
            SnapshotPayload::RateLimitRule(data) => DataPayload::RateLimit(data),
            SnapshotPayload::CircuitBreakerConfig(data) => DataPayload::CircuitBreaker(data),
        }
    }

    /// Rebuilds the plain form from a runtime payload, for persistence.
    pub fn from_payload(payload: &DataPayload) -> Option<Self> {
        match payload {
            DataPayload::Instances(data) => Some(SnapshotPayload::Instances {
                metadata: data.metadata().clone(),
                instances: data
                    .instances()
                    .iter()
                    .map(|inst| InstanceRecord::from_instance(inst))
                    .collect(),
            }),
            DataPayload::RouteRule(data) => Some(SnapshotPayload::RouteRule(data.clone())),
            DataPayload::RateLimit(data) => Some(SnapshotPayload::RateLimitRule(data.clone())),
            DataPayload::CircuitBreaker(data) => {
                Some(SnapshotPayload::CircuitBreakerConfig(data.clone()))
            }
            DataPayload::Empty => None,
        }
    }
}
