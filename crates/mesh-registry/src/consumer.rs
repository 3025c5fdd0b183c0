//! Consumer facade: discovery, routing and selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mesh_registry_balance::CallFeedback;
use mesh_registry_breaker::InstanceGauge;
use mesh_registry_core::model::rules::MetadataRouterParam;
use mesh_registry_core::{
    clock, CallStatus, Criteria, DataKind, Instance, LocalityPick, RegistryError, Result,
    ReturnCode, ServiceInfo, ServiceInstances, ServiceKey,
};
use mesh_registry_router::{apply_availability_filter, RouteInfo, RouteOutcome};

use crate::context::Context;
use crate::stat::ApiKind;

const MAX_REDIRECTS: usize = 3;

/// Request for a single balanced pick.
#[derive(Debug, Clone)]
pub struct GetOneInstanceRequest {
    pub service_key: ServiceKey,
    pub criteria: Criteria,
    pub source: Option<ServiceInfo>,
    pub metadata_param: Option<MetadataRouterParam>,
    pub include_unhealthy: bool,
    pub include_circuit_broken: bool,
    /// Overrides `api.timeout`.
    pub timeout_ms: Option<u64>,
    /// Overrides the configured load-balancer policy.
    pub lb_policy: Option<String>,
}

impl GetOneInstanceRequest {
    pub fn new(service_key: ServiceKey) -> Self {
        Self {
            service_key,
            criteria: Criteria::default(),
            source: None,
            metadata_param: None,
            include_unhealthy: false,
            include_circuit_broken: false,
            timeout_ms: None,
            lb_policy: None,
        }
    }
}

/// Request for the whole routed set.
#[derive(Debug, Clone)]
pub struct GetInstancesRequest {
    pub service_key: ServiceKey,
    pub source: Option<ServiceInfo>,
    pub metadata_param: Option<MetadataRouterParam>,
    pub include_unhealthy: bool,
    pub include_circuit_broken: bool,
    /// Skip the router chain entirely and return the raw available set.
    pub skip_route_filter: bool,
    pub timeout_ms: Option<u64>,
}

impl GetInstancesRequest {
    pub fn new(service_key: ServiceKey) -> Self {
        Self {
            service_key,
            source: None,
            metadata_param: None,
            include_unhealthy: false,
            include_circuit_broken: false,
            skip_route_filter: false,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstancesResponse {
    pub service_key: ServiceKey,
    pub revision: String,
    pub instances: Vec<Instance>,
    /// Subset labels the rule router narrowed to, if any.
    pub subset_key: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Caller-reported outcome of one call to a picked instance.
#[derive(Debug, Clone)]
pub struct ServiceCallResult {
    pub service_key: ServiceKey,
    pub instance_id: String,
    pub status: CallStatus,
    pub latency_ms: u64,
    /// Correlation handle from a locality-aware pick.
    pub locality: Option<LocalityPick>,
    /// Subset attribution for the subset breaker.
    pub subset_key: Option<String>,
}

pub struct ConsumerApi {
    context: Arc<Context>,
}

impl ConsumerApi {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    fn timeout_of(&self, timeout_ms: Option<u64>) -> Duration {
        Duration::from_millis(timeout_ms.unwrap_or(self.context.config().api.timeout).max(1))
    }

    /// Runs the router chain for a request, following redirects, and
    /// applies the final availability gate.
    async fn route(
        &self,
        mut key: ServiceKey,
        source: Option<ServiceInfo>,
        metadata_param: Option<MetadataRouterParam>,
        include_unhealthy: bool,
        include_circuit_broken: bool,
        skip_route_filter: bool,
        timeout: Duration,
    ) -> Result<RouteInfo> {
        let deadline = clock::now_ms() + timeout.as_millis() as u64;
        for _ in 0..=MAX_REDIRECTS {
            let remaining = Duration::from_millis(
                deadline.saturating_sub(clock::now_ms()).max(1),
            );
            let (service, data) = self.context.service_instances(&key, remaining).await?;
            let now_ms = clock::coarse_now_ms();
            // Materialize the breaker chain so published circuit sets are
            // live for this service.
            let _ = self.context.breaker_for(&key);
            let view = ServiceInstances::new(service, data).ok_or_else(|| {
                RegistryError::with_detail(ReturnCode::ServiceNotFound, key.to_string())
            })?;
            let mut info = RouteInfo::new(key.clone(), view);
            info.source = source.clone();
            info.metadata_param = metadata_param.clone();
            info.include_unhealthy = include_unhealthy;
            info.include_circuit_broken = include_circuit_broken;
            info.caller_location = self.context.config().caller_location();
            info.dest_route_rule = self.context.cache().get(&key, DataKind::RouteRule, now_ms).0;
            if let Some(source_key) = source.as_ref().and_then(|s| s.service_key.clone()) {
                self.context
                    .cache()
                    .load_with_notify(&source_key, DataKind::RouteRule, now_ms);
                info.source_route_rule = self
                    .context
                    .cache()
                    .get(&source_key, DataKind::RouteRule, now_ms)
                    .0;
            }

            if !skip_route_filter {
                let chain = self.context.router_chain_for(&key)?;
                match chain.execute(&mut info)? {
                    RouteOutcome::Redirect(target) => {
                        tracing::debug!(from = %key, to = %target, "route redirect");
                        key = target;
                        continue;
                    }
                    RouteOutcome::Narrowed => {}
                }
            }
            apply_availability_filter(&mut info);
            return Ok(info);
        }
        Err(RegistryError::with_detail(
            ReturnCode::InvalidRouteRule,
            "redirect loop in route rules",
        ))
    }

    async fn get_one_inner(&self, request: &GetOneInstanceRequest) -> Result<Instance> {
        request.service_key.validate()?;
        let timeout = self.timeout_of(request.timeout_ms);
        let info = self
            .route(
                request.service_key.clone(),
                request.source.clone(),
                request.metadata_param.clone(),
                request.include_unhealthy,
                request.include_circuit_broken,
                false,
                timeout,
            )
            .await?;
        if info.instances.available().is_empty() {
            return Err(RegistryError::with_detail(
                ReturnCode::InstanceNotFound,
                request.service_key.to_string(),
            ));
        }
        let policy = request
            .lb_policy
            .clone()
            .unwrap_or_else(|| self.context.config().lb_policy_for(&request.service_key));
        let balancer = self.context.balancer_for(&policy)?;
        let pick = balancer.choose(&info.instances, &request.criteria)?;
        Ok(pick.instance.to_picked(pick.locality))
    }

    /// Picks one instance for the request, routing and balancing per the
    /// service configuration.
    pub async fn get_one_instance(&self, request: &GetOneInstanceRequest) -> Result<Instance> {
        let started = clock::now_ms();
        let result = self.get_one_inner(request).await;
        let code = result.as_ref().map(|_| ReturnCode::Ok).unwrap_or_else(|e| e.code());
        self.context.stats().record(
            ApiKind::GetOneInstance,
            code,
            clock::now_ms().saturating_sub(started),
        );
        result
    }

    async fn get_instances_inner(
        &self,
        request: &GetInstancesRequest,
    ) -> Result<InstancesResponse> {
        request.service_key.validate()?;
        let timeout = self.timeout_of(request.timeout_ms);
        let info = self
            .route(
                request.service_key.clone(),
                request.source.clone(),
                request.metadata_param.clone(),
                request.include_unhealthy,
                request.include_circuit_broken,
                request.skip_route_filter,
                timeout,
            )
            .await?;
        if info.instances.available().is_empty() {
            return Err(RegistryError::with_detail(
                ReturnCode::InstanceNotFound,
                request.service_key.to_string(),
            ));
        }
        let set = info.instances.available();
        let subset_key = {
            let key = set.subset_key();
            (!key.is_empty()).then_some(key)
        };
        let data = info.instances.data();
        Ok(InstancesResponse {
            service_key: data.service_key().clone(),
            revision: data.revision().to_string(),
            instances: set.instances().iter().map(|inst| (**inst).clone()).collect(),
            subset_key,
            metadata: data
                .instances()
                .map(|d| d.metadata().clone())
                .unwrap_or_default(),
        })
    }

    /// Returns the whole routed (or raw) instance set.
    pub async fn get_instances(&self, request: &GetInstancesRequest) -> Result<InstancesResponse> {
        let started = clock::now_ms();
        let result = self.get_instances_inner(request).await;
        let code = result.as_ref().map(|_| ReturnCode::Ok).unwrap_or_else(|e| e.code());
        self.context.stats().record(
            ApiKind::GetInstances,
            code,
            clock::now_ms().saturating_sub(started),
        );
        result
    }

    /// Reports a call outcome: drives the circuit breakers and the
    /// feedback-driven balancers.
    pub fn update_service_call_result(&self, result: &ServiceCallResult) -> Result<()> {
        let started = clock::now_ms();
        let outcome = self.update_inner(result);
        let code = outcome
            .as_ref()
            .map(|_| ReturnCode::Ok)
            .unwrap_or_else(|e| e.code());
        self.context.stats().record(
            ApiKind::UpdateServiceCallResult,
            code,
            clock::now_ms().saturating_sub(started),
        );
        outcome
    }

    fn update_inner(&self, result: &ServiceCallResult) -> Result<()> {
        result.service_key.validate()?;
        if result.instance_id.is_empty() {
            return Err(RegistryError::with_detail(
                ReturnCode::InvalidArgument,
                "instance id must be non-empty",
            ));
        }
        let now_ms = clock::coarse_now_ms();
        let breaker = self.context.breaker_for(&result.service_key)?;
        breaker.on_call_result(
            &InstanceGauge {
                service_key: result.service_key.clone(),
                instance_id: result.instance_id.clone(),
                status: result.status,
                latency_ms: result.latency_ms,
                subset_key: result.subset_key.clone(),
            },
            now_ms,
        );
        let feedback = CallFeedback {
            service_key: result.service_key.clone(),
            instance_id: result.instance_id.clone(),
            locality: result.locality,
            latency_ms: result.latency_ms,
            success: !result.status.is_failure(),
        };
        for balancer in self.context.balancer_snapshot() {
            balancer.update_call_result(&feedback);
        }
        if let Some(weights) = self.context.weight_adjuster().on_call_result(&feedback) {
            let interval = self.context.config().consumer.weight_adjuster.sync_interval;
            self.context.cache().update_dynamic_weights(
                &result.service_key,
                &weights,
                interval,
                now_ms,
            );
        }
        Ok(())
    }
}
