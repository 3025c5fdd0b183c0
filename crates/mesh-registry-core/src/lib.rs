//! Core building blocks shared by every mesh-registry crate.
//!
//! This crate carries the pieces the rest of the client is assembled from:
//! - the data model (service keys, instances, versioned service-data
//!   snapshots, derived instance sets)
//! - the client return-code taxonomy and error type
//! - the read-copy-update map backing all hot read paths
//! - the monotonic clock and the deadline-ordered task scheduler
//! - the notification primitive used to park callers until first sync
//! - the process-wide plugin registry

pub mod clock;
pub mod codes;
pub mod events;
pub mod model;
pub mod notify;
pub mod plugin;
pub mod rcu;
pub mod sched;

pub use codes::{RegistryError, Result, ReturnCode};
pub use model::{
    CallStatus, CircuitState, CircuitView, Criteria, DataKind, DataPayload, DataStatus, Instance,
    InstanceBuilder, InstancesData, InstancesSet, Location, LocalityPick, MetadataFailover,
    Selector, Service, ServiceData, ServiceInfo, ServiceInstances, ServiceKey, SubsetStateView,
};
pub use notify::SyncNotify;
pub use plugin::{get_plugin, register_plugin, PluginFactory, PluginKind};
pub use rcu::RcuMap;
pub use sched::{Reactor, ReactorHandle, Task, TaskHandle, TaskOutcome, TaskQueue};
