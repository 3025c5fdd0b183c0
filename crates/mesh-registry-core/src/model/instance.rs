use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::Location;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Locality-aware pick correlation handle: a 20-bit route key and the low
/// 44 bits of the pick's begin time in milliseconds, packed into one word.
///
/// Begin times wrap modulo 2^44; a feedback whose decoded begin time sits in
/// the future relative to the current clock is treated as stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalityPick(pub u64);

const BEGIN_MS_BITS: u32 = 44;
const BEGIN_MS_MASK: u64 = (1 << BEGIN_MS_BITS) - 1;
const ROUTE_KEY_MASK: u64 = (1 << 20) - 1;

impl LocalityPick {
    pub fn pack(route_key: u32, begin_ms: u64) -> Self {
        let key = (route_key as u64) & ROUTE_KEY_MASK;
        LocalityPick((key << BEGIN_MS_BITS) | (begin_ms & BEGIN_MS_MASK))
    }

    pub fn route_key(self) -> u32 {
        ((self.0 >> BEGIN_MS_BITS) & ROUTE_KEY_MASK) as u32
    }

    pub fn begin_ms(self) -> u64 {
        self.0 & BEGIN_MS_MASK
    }

    /// Elapsed ms since the pick, honoring the 44-bit wrap. Returns `None`
    /// for a feedback dated after `now_ms` (stale handle from a previous
    /// route-key generation).
    pub fn elapsed_ms(self, now_ms: u64) -> Option<u64> {
        let now = now_ms & BEGIN_MS_MASK;
        let begin = self.begin_ms();
        if now >= begin {
            Some(now - begin)
        } else {
            None
        }
    }
}

/// One backend instance of a service.
///
/// Immutable after construction except for the dynamic weight, which the
/// weight adjuster updates out-of-band, and the locality pick handle set on
/// the copy handed back to the caller.
#[derive(Debug)]
pub struct Instance {
    id: String,
    host: String,
    port: u16,
    weight: u32,
    priority: u32,
    protocol: String,
    version: String,
    metadata: HashMap<String, String>,
    location: Location,
    healthy: bool,
    isolate: bool,
    /// Process-local id assigned on first appearance, for connection-pool
    /// keying.
    local_id: u64,
    dynamic_weight: AtomicU32,
    locality_pick: Option<LocalityPick>,
}

impl Instance {
    pub fn builder(id: impl Into<String>, host: impl Into<String>, port: u16) -> InstanceBuilder {
        InstanceBuilder::new(id, host, port)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Static weight in `[0, 1000]` set at registration time.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Lower value means higher priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn is_isolated(&self) -> bool {
        self.isolate
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn dynamic_weight(&self) -> u32 {
        self.dynamic_weight.load(Ordering::Relaxed)
    }

    pub fn set_dynamic_weight(&self, weight: u32) {
        self.dynamic_weight.store(weight, Ordering::Relaxed);
    }

    pub fn locality_pick(&self) -> Option<LocalityPick> {
        self.locality_pick
    }

    /// Copy handed to the caller by `get_one_instance`, carrying the pick
    /// correlation handle for the locality-aware balancer.
    pub fn to_picked(&self, pick: Option<LocalityPick>) -> Instance {
        let mut copy = self.clone();
        copy.locality_pick = pick;
        copy
    }
}

impl Clone for Instance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight,
            priority: self.priority,
            protocol: self.protocol.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            location: self.location.clone(),
            healthy: self.healthy,
            isolate: self.isolate,
            local_id: self.local_id,
            dynamic_weight: AtomicU32::new(self.dynamic_weight()),
            locality_pick: self.locality_pick,
        }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Instance {}

/// Builder for [`Instance`]; weight saturates at 1000.
#[derive(Debug)]
pub struct InstanceBuilder {
    id: String,
    host: String,
    port: u16,
    weight: u32,
    priority: u32,
    protocol: String,
    version: String,
    metadata: HashMap<String, String>,
    location: Location,
    healthy: bool,
    isolate: bool,
}

impl InstanceBuilder {
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

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.min(1000);
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    pub fn isolate(mut self, isolate: bool) -> Self {
        self.isolate = isolate;
        self
    }

    pub fn build(self) -> Instance {
        let weight = self.weight;
        Instance {
            id: self.id,
            host: self.host,
            port: self.port,
            weight,
            priority: self.priority,
            protocol: self.protocol,
            version: self.version,
            metadata: self.metadata,
            location: self.location,
            healthy: self.healthy,
            isolate: self.isolate,
            local_id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            dynamic_weight: AtomicU32::new(weight),
            locality_pick: None,
        }
    }
}
