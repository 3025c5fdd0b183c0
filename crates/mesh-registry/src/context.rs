//! Context: one fully wired client runtime.
//!
//! Creating a context installs the default plugin set (first context only),
//! builds the cache, connector and quota manager, and starts the reactor
//! thread: a dedicated thread running a current-thread tokio runtime that
//! owns the scheduler heap, the discover stream, cache GC, circuit-breaker
//! timing passes, health-check dispatch and rate-limit reconciliation.
//! Caller-facing work (routing, balancing) runs inline on the caller
//! thread and never touches the reactor.

use std::collections::HashMap;
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use mesh_registry_balance::{
    build_balancer, BalanceConfig, LoadBalancer, NoopWeightAdjuster, WeightAdjuster,
};
use mesh_registry_breaker::{
    CircuitBreakerChain, CircuitEvent, ErrorCountBreaker, ErrorCountConfig, ErrorRateBreaker,
    ErrorRateConfig,
};
use mesh_registry_cache::ServiceDataCache;
use mesh_registry_connector::{DiscoverTransport, ServerConnector};
use mesh_registry_core::events::{EventListeners, FnListener};
use mesh_registry_core::{
    clock, plugin, DataKind, DataStatus, Reactor, ReactorHandle, RegistryError, Result,
    ReturnCode, Service, ServiceData, ServiceKey, TaskOutcome,
};
use mesh_registry_healthcheck::{HealthCheckChain, ProbeWhen};
use mesh_registry_ratelimit::QuotaManager;
use mesh_registry_router::{
    CanaryRouter, MetadataRouter, NearbyRouter, RouterChain, RuleRouter, SetDivisionRouter,
};

use crate::config::Config;
use crate::consumer::ConsumerApi;
use crate::limit::LimitApi;
use crate::provider::ProviderApi;
use crate::stat::ApiStatRegistry;

static INSTALL_DEFAULTS: Once = Once::new();

fn factory_of<T: std::any::Any + Send + Sync>(make: fn() -> T) -> plugin::PluginFactory {
    Arc::new(move || Box::new(make()) as Box<dyn std::any::Any + Send + Sync>)
}

/// Registers the default plugin set in the process-wide registry. Runs
/// once, on the first context.
fn install_default_plugins() {
    INSTALL_DEFAULTS.call_once(|| {
        use mesh_registry_core::plugin::PluginKind;
        let entries: Vec<(&str, PluginKind, plugin::PluginFactory)> = vec![
            (
                RuleRouter::NAME,
                PluginKind::ServiceRouter,
                factory_of(|| RuleRouter::new()),
            ),
            (
                NearbyRouter::NAME,
                PluginKind::ServiceRouter,
                factory_of(|| NearbyRouter::new(Default::default())),
            ),
            (
                SetDivisionRouter::NAME,
                PluginKind::ServiceRouter,
                factory_of(SetDivisionRouter::new),
            ),
            (
                CanaryRouter::NAME,
                PluginKind::ServiceRouter,
                factory_of(CanaryRouter::new),
            ),
            (
                MetadataRouter::NAME,
                PluginKind::ServiceRouter,
                factory_of(MetadataRouter::new),
            ),
            (
                ErrorCountBreaker::NAME,
                PluginKind::CircuitBreaker,
                factory_of(|| ErrorCountBreaker::new(ErrorCountConfig::default())),
            ),
            (
                ErrorRateBreaker::NAME,
                PluginKind::CircuitBreaker,
                factory_of(|| ErrorRateBreaker::new(ErrorRateConfig::default())),
            ),
            (
                "tcp",
                PluginKind::HealthChecker,
                factory_of(|| mesh_registry_healthcheck::TcpProber::new(Default::default())),
            ),
            (
                "http",
                PluginKind::HealthChecker,
                factory_of(|| mesh_registry_healthcheck::HttpProber::new(Default::default())),
            ),
            (
                "udp",
                PluginKind::HealthChecker,
                factory_of(|| mesh_registry_healthcheck::UdpProber::new(Default::default())),
            ),
            (
                NoopWeightAdjuster::NAME,
                PluginKind::WeightAdjuster,
                factory_of(NoopWeightAdjuster::new),
            ),
        ];
        let mut balancer_names = vec![
            mesh_registry_balance::WeightedRandomBalancer::NAME,
            mesh_registry_balance::RingHashBalancer::NAME,
            mesh_registry_balance::MaglevBalancer::NAME,
            mesh_registry_balance::CMurmurBalancer::NAME,
            mesh_registry_balance::SimpleHashBalancer::NAME,
            mesh_registry_balance::LocalityAwareBalancer::NAME,
        ];
        for (name, kind, factory) in entries {
            if let Err(err) = plugin::register_plugin(name, kind, factory) {
                tracing::debug!(plugin = name, error = %err, "default plugin already present");
            }
        }
        for name in balancer_names.drain(..) {
            let owned = name.to_string();
            let factory: plugin::PluginFactory =
                Arc::new(move || -> Box<dyn std::any::Any + Send + Sync> {
                    match build_balancer(&owned, &BalanceConfig::default()) {
                        Ok(balancer) => Box::new(balancer),
                        Err(_) => Box::new(()),
                    }
                });
            if let Err(err) = plugin::register_plugin(name, plugin::PluginKind::LoadBalancer, factory)
            {
                tracing::debug!(plugin = name, error = %err, "default plugin already present");
            }
        }
    });
}

pub struct Context {
    config: Config,
    cache: Arc<ServiceDataCache>,
    connector: Arc<ServerConnector>,
    quota: Arc<QuotaManager>,
    stats: Arc<ApiStatRegistry>,
    reactor: ReactorHandle,
    default_router: Arc<RouterChain>,
    router_overrides: Mutex<HashMap<ServiceKey, Arc<RouterChain>>>,
    balancers: Mutex<HashMap<String, Arc<dyn LoadBalancer>>>,
    adjuster: Arc<dyn WeightAdjuster>,
    breakers: Arc<Mutex<HashMap<ServiceKey, Arc<CircuitBreakerChain>>>>,
    health_chains: Mutex<HashMap<ServiceKey, Arc<HealthCheckChain>>>,
    shutdown_tx: watch::Sender<bool>,
    reactor_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Context {
    pub fn create(config: Config, transport: Arc<dyn DiscoverTransport>) -> Result<Arc<Self>> {
        install_default_plugins();
        // Surface config mistakes at startup, not on first request.
        config.router_config(None)?;
        config.health_config(None)?;
        let rate_limit = config.rate_limit_config()?;

        let now_ms = clock::tick();
        let cache = Arc::new(ServiceDataCache::new(config.cache_config()));
        cache.load_from_disk(now_ms);
        let connector =
            ServerConnector::new(config.connector_config(), transport, cache.clone())?;
        cache.set_driver(connector.driver());
        let quota = Arc::new(QuotaManager::new(rate_limit));
        let default_router = Arc::new(RouterChain::new(&config.router_config(None)?)?);
        let adjuster: Arc<dyn WeightAdjuster> =
            match config.consumer.weight_adjuster.name.as_str() {
                NoopWeightAdjuster::NAME => Arc::new(NoopWeightAdjuster::new()),
                other => {
                    return Err(RegistryError::with_detail(
                        ReturnCode::PluginError,
                        format!("unknown weight adjuster {other}"),
                    ));
                }
            };
        let (reactor, reactor_handle) = Reactor::new();
        let (shutdown_tx, _) = watch::channel(false);

        let context = Arc::new(Self {
            config,
            cache,
            connector,
            quota,
            stats: Arc::new(ApiStatRegistry::new()),
            reactor: reactor_handle,
            default_router,
            router_overrides: Mutex::new(HashMap::new()),
            balancers: Mutex::new(HashMap::new()),
            adjuster,
            breakers: Arc::new(Mutex::new(HashMap::new())),
            health_chains: Mutex::new(HashMap::new()),
            shutdown_tx,
            reactor_thread: Mutex::new(None),
        });

        // A circuit-breaker config push invalidates the cached chain so
        // the next request rebuilds it with the new thresholds.
        {
            let breakers = context.breakers.clone();
            context.cache.add_pre_update_hook(Arc::new(move |key, kind, _, _| {
                if kind == DataKind::CircuitBreakerConfig {
                    breakers.lock().remove(key);
                }
            }));
        }

        context.schedule_background_tasks();
        context.start_reactor_thread(reactor)?;
        Ok(context)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ServiceDataCache> {
        &self.cache
    }

    pub(crate) fn connector(&self) -> &Arc<ServerConnector> {
        &self.connector
    }

    pub(crate) fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    pub(crate) fn stats(&self) -> &Arc<ApiStatRegistry> {
        &self.stats
    }

    pub fn consumer(self: &Arc<Self>) -> ConsumerApi {
        ConsumerApi::new(self.clone())
    }

    pub fn provider(self: &Arc<Self>) -> ProviderApi {
        ProviderApi::new(self.clone())
    }

    pub fn limit(self: &Arc<Self>) -> LimitApi {
        LimitApi::new(self.clone())
    }

    fn schedule_background_tasks(self: &Arc<Self>) {
        // Cache GC + RCU reclamation.
        {
            let cache = self.cache.clone();
            self.reactor.schedule(
                Box::new(move |now_ms| {
                    cache.gc_expired(now_ms);
                    cache.run_rcu_gc(now_ms);
                    TaskOutcome::Reschedule(Duration::from_secs(10))
                }),
                Duration::from_secs(10),
            );
        }
        // Circuit-breaker timing pass.
        {
            let breakers = self.breakers.clone();
            let period = Duration::from_millis(
                self.config.consumer.circuit_breaker.check_period.max(50),
            );
            self.reactor.schedule(
                Box::new(move |now_ms| {
                    let chains: Vec<_> = breakers.lock().values().cloned().collect();
                    for chain in chains {
                        chain.timing_pass(now_ms);
                    }
                    TaskOutcome::Reschedule(period)
                }),
                period,
            );
        }
        // API stat flush.
        {
            let stats = self.stats.clone();
            let period =
                Duration::from_millis(self.config.api.stat_flush_interval.max(1_000));
            self.reactor.schedule(
                Box::new(move |_| {
                    stats.flush();
                    TaskOutcome::Reschedule(period)
                }),
                period,
            );
        }
        // Rate-limit window RCU reclamation (reconciliation is async and
        // runs on the runtime, below).
        {
            let quota = self.quota.clone();
            self.reactor.schedule(
                Box::new(move |now_ms| {
                    quota.run_rcu_gc(now_ms);
                    TaskOutcome::Reschedule(Duration::from_secs(5))
                }),
                Duration::from_secs(5),
            );
        }
    }

    fn start_reactor_thread(self: &Arc<Self>, reactor: Reactor) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                RegistryError::with_detail(ReturnCode::UnknownError, err.to_string())
            })?;
        let connector = self.connector.clone();
        let quota = self.quota.clone();
        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reconcile_interval =
            Duration::from_millis(self.quota.config().reconcile_interval_ms.max(100));
        let health_interval =
            Duration::from_millis(self.config.consumer.health_check.interval.max(500));
        let report_interval = Duration::from_millis(self.config.api.report_interval.max(1_000));
        let bind_ip = self.config.api.bind_ip.clone();

        let thread = std::thread::Builder::new()
            .name("mesh-registry-reactor".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    tokio::spawn(reactor.run());
                    tokio::spawn(connector.clone().run());
                    tokio::spawn(quota_loop(quota, reconcile_interval));
                    tokio::spawn(health_loop(weak.clone(), health_interval));
                    tokio::spawn(report_loop(connector, bind_ip, report_interval));
                    let _ = shutdown_rx.changed().await;
                });
                // Dropping the runtime cancels every background task.
            })
            .map_err(|err| {
                RegistryError::with_detail(ReturnCode::UnknownError, err.to_string())
            })?;
        *self.reactor_thread.lock() = Some(thread);
        Ok(())
    }

    /// Blocks new work, drains the reactor and joins its thread, then
    /// drops every cached reference.
    pub fn destroy(&self) {
        self.shutdown_tx.send_replace(true);
        self.connector.shutdown();
        self.reactor.shutdown();
        if let Some(thread) = self.reactor_thread.lock().take() {
            // The last reference can be dropped by a background task on
            // the reactor thread itself; never self-join.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
        self.breakers.lock().clear();
        self.router_overrides.lock().clear();
        self.balancers.lock().clear();
        self.health_chains.lock().clear();
    }

    /// Instances snapshot for a key, parking the caller until first sync
    /// or the deadline.
    pub(crate) async fn service_instances(
        &self,
        key: &ServiceKey,
        timeout: Duration,
    ) -> Result<(Arc<Service>, Arc<ServiceData>)> {
        let now_ms = clock::coarse_now_ms();
        // Routing data rides along with the instances subscription.
        self.cache.load_with_notify(key, DataKind::RouteRule, now_ms);
        let (data, status) = self.cache.get(key, DataKind::Instances, now_ms);
        match status {
            DataStatus::Syncing | DataStatus::LoadedFromDisk => {
                if let Some(data) = data {
                    return Ok((self.cache.service(key, now_ms), data));
                }
            }
            DataStatus::NotFound => {
                return Err(RegistryError::with_detail(
                    ReturnCode::ServiceNotFound,
                    key.to_string(),
                ));
            }
            DataStatus::NotInit => {}
        }
        let notify = self.cache.load_with_notify(key, DataKind::Instances, now_ms);
        if !notify.wait_ready(timeout).await {
            return Err(RegistryError::with_detail(
                ReturnCode::Timeout,
                format!("first sync of {key} timed out"),
            ));
        }
        let now_ms = clock::coarse_now_ms();
        let (data, status) = self.cache.get(key, DataKind::Instances, now_ms);
        match (data, status) {
            (Some(data), DataStatus::Syncing | DataStatus::LoadedFromDisk) => {
                Ok((self.cache.service(key, now_ms), data))
            }
            (_, DataStatus::NotFound) => Err(RegistryError::with_detail(
                ReturnCode::ServiceNotFound,
                key.to_string(),
            )),
            _ => Err(RegistryError::new(ReturnCode::NotInit)),
        }
    }

    pub(crate) fn router_chain_for(&self, key: &ServiceKey) -> Result<Arc<RouterChain>> {
        if self.config.service_override(key).is_none() {
            return Ok(self.default_router.clone());
        }
        let mut overrides = self.router_overrides.lock();
        if let Some(chain) = overrides.get(key) {
            return Ok(chain.clone());
        }
        let chain = Arc::new(RouterChain::new(&self.config.router_config(Some(key))?)?);
        overrides.insert(key.clone(), chain.clone());
        Ok(chain)
    }

    pub(crate) fn balancer_for(&self, policy: &str) -> Result<Arc<dyn LoadBalancer>> {
        let mut balancers = self.balancers.lock();
        if let Some(balancer) = balancers.get(policy) {
            return Ok(balancer.clone());
        }
        let balancer: Arc<dyn LoadBalancer> =
            build_balancer(policy, &self.config.balance_config())?.into();
        balancers.insert(policy.to_string(), balancer.clone());
        Ok(balancer)
    }

    pub(crate) fn balancer_snapshot(&self) -> Vec<Arc<dyn LoadBalancer>> {
        self.balancers.lock().values().cloned().collect()
    }

    pub(crate) fn weight_adjuster(&self) -> &Arc<dyn WeightAdjuster> {
        &self.adjuster
    }

    pub(crate) fn breaker_for(&self, key: &ServiceKey) -> Result<Arc<CircuitBreakerChain>> {
        {
            let breakers = self.breakers.lock();
            if let Some(chain) = breakers.get(key) {
                return Ok(chain.clone());
            }
        }
        let now_ms = clock::coarse_now_ms();
        let overrides = self
            .cache
            .get(key, DataKind::CircuitBreakerConfig, now_ms)
            .0
            .and_then(|data| data.circuit_breaker_config().cloned());
        let service = self.cache.service(key, now_ms);
        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(|event: &CircuitEvent| {
            let CircuitEvent::Transition {
                service,
                instance_id,
                from,
                to,
                ..
            } = event;
            tracing::debug!(%service, instance = %instance_id, ?from, ?to, "circuit event");
        }));
        let chain = Arc::new(CircuitBreakerChain::new(
            service,
            &self.config.breaker_config(Some(key)),
            overrides.as_ref(),
            listeners,
        )?);
        let health = self.config.health_config(Some(key))?;
        if health.when != ProbeWhen::Never {
            // The health checker owns recovery transitions.
            chain.data().set_auto_half_open(false);
        }
        let mut breakers = self.breakers.lock();
        let chain = breakers.entry(key.clone()).or_insert(chain).clone();
        Ok(chain)
    }

    fn health_chain_for(&self, key: &ServiceKey) -> Result<(ProbeWhen, Arc<HealthCheckChain>)> {
        let config = self.config.health_config(Some(key))?;
        let when = config.when;
        let mut chains = self.health_chains.lock();
        if let Some(chain) = chains.get(key) {
            return Ok((when, chain.clone()));
        }
        let chain = Arc::new(HealthCheckChain::new(&config)?);
        chains.insert(key.clone(), chain.clone());
        Ok((when, chain))
    }

    /// One dispatch of the active health checker over every cached
    /// service.
    pub(crate) async fn health_pass(&self) {
        let now_ms = clock::coarse_now_ms();
        for key in self.cache.list_keys(DataKind::Instances) {
            let Ok((when, chain)) = self.health_chain_for(&key) else {
                continue;
            };
            if when == ProbeWhen::Never || chain.is_empty() {
                continue;
            }
            let Ok(breaker) = self.breaker_for(&key) else {
                continue;
            };
            let (Some(data), _) = self.cache.get(&key, DataKind::Instances, now_ms) else {
                continue;
            };
            let Some(instances) = data.instances() else {
                continue;
            };
            for instance in instances.instances() {
                let state = breaker.state_of(instance.id());
                if !when.should_probe(state, instance.is_isolated()) {
                    continue;
                }
                let healthy = chain.check(instance.host(), instance.port()).await;
                match when {
                    ProbeWhen::OnRecover => {
                        if healthy {
                            breaker.data().promote_half_open(instance.id());
                        }
                    }
                    ProbeWhen::Always => {
                        if healthy {
                            breaker.data().close_by_health(instance.id());
                        } else {
                            breaker.data().open_by_health(instance.id());
                        }
                    }
                    ProbeWhen::Never => {}
                }
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn quota_loop(quota: Arc<QuotaManager>, interval: Duration) {
    let mut ticks = 0u64;
    loop {
        tokio::time::sleep(interval).await;
        let now_ms = clock::coarse_now_ms();
        quota.reconcile_due(now_ms).await;
        ticks += 1;
        // The expiry sweep is far coarser than reconciliation.
        if ticks % 10 == 0 {
            quota.sweep_expired(now_ms).await;
        }
    }
}

async fn health_loop(context: Weak<Context>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(context) = context.upgrade() else {
            return;
        };
        context.health_pass().await;
    }
}

async fn report_loop(
    connector: Arc<ServerConnector>,
    bind_ip: String,
    interval: Duration,
) {
    let version = env!("CARGO_PKG_VERSION");
    loop {
        tokio::time::sleep(interval).await;
        connector.report_client(&bind_ip, version).await;
    }
}
