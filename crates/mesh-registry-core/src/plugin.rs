//! Process-wide plugin registry.
//!
//! Plugins are typed factories registered under `(name, kind)`. The default
//! set is installed by the first context; embedders may add their own before
//! creating a context. Registration of a taken `(name, kind)` returns
//! `ExistedResource`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::codes::{RegistryError, Result, ReturnCode};

/// Behavioural capability a plugin provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    ServiceRouter,
    LoadBalancer,
    CircuitBreaker,
    HealthChecker,
    WeightAdjuster,
    ServerConnector,
}

/// A factory producing a boxed plugin instance. The concrete box type is
/// downcast by the owning subsystem.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<(String, PluginKind), PluginFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a factory for `(name, kind)`.
pub fn register_plugin(
    name: impl Into<String>,
    kind: PluginKind,
    factory: PluginFactory,
) -> Result<()> {
    let name = name.into();
    let mut registry = REGISTRY.write();
    if registry.contains_key(&(name.clone(), kind)) {
        return Err(RegistryError::with_detail(
            ReturnCode::ExistedResource,
            format!("plugin {name} already registered for {kind:?}"),
        ));
    }
    registry.insert((name, kind), factory);
    Ok(())
}

/// Looks up the factory registered for `(name, kind)`.
pub fn get_plugin(name: &str, kind: PluginKind) -> Option<PluginFactory> {
    REGISTRY.read().get(&(name.to_string(), kind)).cloned()
}

/// Instantiates the plugin and downcasts to the requested box type.
pub fn instantiate<T: Any + Send + Sync>(name: &str, kind: PluginKind) -> Result<Box<T>> {
    let factory = get_plugin(name, kind).ok_or_else(|| {
        RegistryError::with_detail(
            ReturnCode::PluginError,
            format!("no plugin {name} registered for {kind:?}"),
        )
    })?;
    factory().downcast::<T>().map_err(|_| {
        RegistryError::with_detail(
            ReturnCode::PluginError,
            format!("plugin {name} has unexpected type for {kind:?}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_get_round_trip() {
        let factory: PluginFactory = Arc::new(|| Box::new(42u32));
        register_plugin("test-rt", PluginKind::WeightAdjuster, factory.clone()).unwrap();
        let fetched = get_plugin("test-rt", PluginKind::WeightAdjuster).unwrap();
        assert!(Arc::ptr_eq(&factory, &fetched));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let factory: PluginFactory = Arc::new(|| Box::new(1u32));
        register_plugin("test-dup", PluginKind::LoadBalancer, factory.clone()).unwrap();
        let err = register_plugin("test-dup", PluginKind::LoadBalancer, factory).unwrap_err();
        assert_eq!(err.code(), ReturnCode::ExistedResource);
    }

    #[test]
    fn same_name_different_kind_is_allowed() {
        let factory: PluginFactory = Arc::new(|| Box::new(1u32));
        register_plugin("test-kinds", PluginKind::ServiceRouter, factory.clone()).unwrap();
        register_plugin("test-kinds", PluginKind::HealthChecker, factory).unwrap();
    }

    #[test]
    fn instantiate_downcasts() {
        register_plugin(
            "test-inst",
            PluginKind::CircuitBreaker,
            Arc::new(|| Box::new("breaker".to_string())),
        )
        .unwrap();
        let value: Box<String> = instantiate("test-inst", PluginKind::CircuitBreaker).unwrap();
        assert_eq!(*value, "breaker");
        let err = instantiate::<u64>("test-inst", PluginKind::CircuitBreaker).unwrap_err();
        assert_eq!(err.code(), ReturnCode::PluginError);
    }
}
