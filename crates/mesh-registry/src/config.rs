//! YAML-shaped client configuration.
//!
//! The tree mirrors what operators deploy: `global.serverConnector`,
//! `consumer.*` with per-service overrides, `rateLimiter` and `api`.
//! Every knob has a default so an empty document is a valid config, and
//! canonical input round-trips through `from_str`/`to_string`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mesh_registry_balance::BalanceConfig;
use mesh_registry_breaker::{BreakerConfig, ErrorCountConfig, ErrorRateConfig};
use mesh_registry_cache::CacheConfig;
use mesh_registry_connector::ConnectorConfig;
use mesh_registry_core::{Location, RegistryError, Result, ReturnCode, ServiceKey};
use mesh_registry_healthcheck::{HealthCheckConfig, ProbeWhen};
use mesh_registry_ratelimit::{RateLimitConfig, RateLimitMode};
use mesh_registry_router::{MatchLevel, NearbyConfig, RouterChainConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub global: GlobalConfig,
    pub consumer: ConsumerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub server_connector: ServerConnectorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConnectorConfig {
    pub addresses: Vec<String>,
    pub protocol: String,
    pub connect_timeout: u64,
    pub message_timeout: u64,
    pub server_switch_interval: u64,
}

impl Default for ServerConnectorConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            protocol: "grpc".to_string(),
            connect_timeout: 500,
            message_timeout: 1_000,
            server_switch_interval: 600_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerConfig {
    pub local_cache: LocalCacheConfig,
    pub service_router: ServiceRouterConfig,
    pub load_balancer: LoadBalancerConfig,
    pub circuit_breaker: CircuitBreakerSection,
    pub health_check: HealthCheckSection,
    pub weight_adjuster: WeightAdjusterConfig,
    pub service: Vec<ServiceOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalCacheConfig {
    pub persist_dir: Option<String>,
    pub service_expire_time: u64,
    pub service_refresh_interval: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            persist_dir: None,
            service_expire_time: 24 * 60 * 60 * 1000,
            service_refresh_interval: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceRouterConfig {
    pub chain: Vec<String>,
    pub plugin: RouterPluginConfig,
}

impl Default for ServiceRouterConfig {
    fn default() -> Self {
        Self {
            chain: RouterChainConfig::default().chain,
            plugin: RouterPluginConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterPluginConfig {
    pub nearby_based_router: NearbySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NearbySection {
    pub match_level: String,
    pub max_match_level: String,
}

impl Default for NearbySection {
    fn default() -> Self {
        Self {
            match_level: "campus".to_string(),
            max_match_level: "region".to_string(),
        }
    }
}

fn parse_match_level(value: &str) -> Result<MatchLevel> {
    match value {
        "campus" => Ok(MatchLevel::Campus),
        "zone" => Ok(MatchLevel::Zone),
        "region" => Ok(MatchLevel::Region),
        other => Err(RegistryError::with_detail(
            ReturnCode::InvalidConfig,
            format!("unknown nearby match level {other}"),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerConfig {
    #[serde(rename = "type")]
    pub policy: String,
    pub enable_dynamic_weight: bool,
    pub vnode_count: u32,
    pub hash_func: String,
    pub maglev_table_size: u32,
    pub compat_replicas: u32,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        let defaults = BalanceConfig::default();
        Self {
            policy: defaults.policy,
            enable_dynamic_weight: defaults.enable_dynamic_weight,
            vnode_count: defaults.vnode_count,
            hash_func: defaults.hash_func,
            maglev_table_size: defaults.maglev_table_size,
            compat_replicas: defaults.compat_replicas,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSection {
    pub enable: bool,
    pub check_period: u64,
    pub chain: Vec<String>,
    pub plugin: CircuitBreakerPluginSection,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            enable: defaults.enabled,
            check_period: defaults.check_period_ms,
            chain: defaults.chain,
            plugin: CircuitBreakerPluginSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerPluginSection {
    pub error_count: ErrorCountSection,
    pub error_rate: ErrorRateSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorCountSection {
    pub continuous_error_threshold: u32,
    pub sleep_window: u64,
    pub request_count_after_half_open: u32,
    pub success_count_after_half_open: u32,
    pub metric_expired_time: u64,
}

impl Default for ErrorCountSection {
    fn default() -> Self {
        let defaults = ErrorCountConfig::default();
        Self {
            continuous_error_threshold: defaults.continuous_threshold,
            sleep_window: defaults.sleep_window_ms,
            request_count_after_half_open: defaults.request_after_half_open,
            success_count_after_half_open: defaults.success_count_to_close,
            metric_expired_time: defaults.metric_expired_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorRateSection {
    pub metric_stat_time_window: u64,
    pub metric_num_buckets: usize,
    pub request_volume_threshold: u32,
    pub error_rate_threshold: f64,
    pub preserve_threshold: f64,
    pub sleep_window: u64,
    pub request_count_after_half_open: u32,
    pub success_count_after_half_open: u32,
    pub metric_expired_time: u64,
}

impl Default for ErrorRateSection {
    fn default() -> Self {
        let defaults = ErrorRateConfig::default();
        Self {
            metric_stat_time_window: defaults.window_ms,
            metric_num_buckets: defaults.num_buckets,
            request_volume_threshold: defaults.request_volume_threshold,
            error_rate_threshold: defaults.error_rate_threshold,
            preserve_threshold: defaults.preserve_threshold,
            sleep_window: defaults.sleep_window_ms,
            request_count_after_half_open: defaults.request_after_half_open,
            success_count_after_half_open: defaults.success_count_to_close,
            metric_expired_time: defaults.metric_expired_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckSection {
    pub when: String,
    pub interval: u64,
    pub timeout: u64,
    pub chain: Vec<String>,
    pub plugin: HealthCheckPluginSection,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            when: "never".to_string(),
            interval: 10_000,
            timeout: 500,
            chain: vec!["tcp".to_string()],
            plugin: HealthCheckPluginSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckPluginSection {
    pub tcp: TcpSection,
    pub http: HttpSection,
    pub udp: UdpSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpSection {
    pub send: String,
    pub receive: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSection {
    pub path: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpSection {
    pub send: String,
    pub receive: String,
}

fn parse_probe_when(value: &str) -> Result<ProbeWhen> {
    match value {
        "never" => Ok(ProbeWhen::Never),
        "on_recover" | "onRecover" => Ok(ProbeWhen::OnRecover),
        "always" => Ok(ProbeWhen::Always),
        other => Err(RegistryError::with_detail(
            ReturnCode::InvalidConfig,
            format!("unknown health check trigger {other}"),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightAdjusterConfig {
    pub name: String,
    pub sync_interval: u64,
}

impl Default for WeightAdjusterConfig {
    fn default() -> Self {
        Self {
            name: "none".to_string(),
            sync_interval: 10_000,
        }
    }
}

/// Per-service overrides; unset fields inherit the consumer defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOverride {
    pub namespace: String,
    pub name: String,
    pub service_router_chain: Option<Vec<String>>,
    pub load_balancer_type: Option<String>,
    pub circuit_breaker_enable: Option<bool>,
    pub health_check_when: Option<String>,
    pub service_refresh_interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimiterConfig {
    pub mode: String,
    pub rate_limit_cluster: Option<ServiceKey>,
    pub window_expire_time: u64,
    pub reconcile_interval: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            mode: "local".to_string(),
            rate_limit_cluster: None,
            window_expire_time: 60_000,
            reconcile_interval: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub timeout: u64,
    pub max_retry_times: u32,
    pub retry_interval: u64,
    pub bind_if: String,
    #[serde(rename = "bindIP")]
    pub bind_ip: String,
    pub location: LocationConfig,
    pub report_interval: u64,
    pub stat_flush_interval: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout: 1_000,
            max_retry_times: 3,
            retry_interval: 100,
            bind_if: String::new(),
            bind_ip: "127.0.0.1".to_string(),
            location: LocationConfig::default(),
            report_interval: 60_000,
            stat_flush_interval: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationConfig {
    pub region: String,
    pub zone: String,
    pub campus: String,
}

impl Config {
    pub fn from_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|err| RegistryError::with_detail(ReturnCode::InvalidConfig, err.to_string()))
    }

    pub fn to_string(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|err| RegistryError::with_detail(ReturnCode::InvalidConfig, err.to_string()))
    }

    pub fn service_override(&self, key: &ServiceKey) -> Option<&ServiceOverride> {
        self.consumer
            .service
            .iter()
            .find(|entry| entry.namespace == key.namespace && entry.name == key.name)
    }

    pub fn caller_location(&self) -> Location {
        Location::new(
            self.api.location.region.clone(),
            self.api.location.zone.clone(),
            self.api.location.campus.clone(),
        )
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            persist_dir: self.consumer.local_cache.persist_dir.clone().map(Into::into),
            service_expire_ms: self.consumer.local_cache.service_expire_time,
            refresh_interval_ms: self.consumer.local_cache.service_refresh_interval,
            ..CacheConfig::default()
        }
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        let section = &self.global.server_connector;
        ConnectorConfig {
            addresses: section.addresses.clone(),
            protocol: section.protocol.clone(),
            connect_timeout_ms: section.connect_timeout,
            message_timeout_ms: section.message_timeout,
            server_switch_interval_ms: section.server_switch_interval,
            sync_interval_ms: self.consumer.local_cache.service_refresh_interval,
            ..ConnectorConfig::default()
        }
    }

    pub fn router_config(&self, key: Option<&ServiceKey>) -> Result<RouterChainConfig> {
        let nearby = &self.consumer.service_router.plugin.nearby_based_router;
        let chain = key
            .and_then(|key| self.service_override(key))
            .and_then(|o| o.service_router_chain.clone())
            .unwrap_or_else(|| self.consumer.service_router.chain.clone());
        Ok(RouterChainConfig {
            chain,
            nearby: NearbyConfig {
                match_level: parse_match_level(&nearby.match_level)?,
                max_match_level: parse_match_level(&nearby.max_match_level)?,
            },
        })
    }

    pub fn balance_config(&self) -> BalanceConfig {
        let section = &self.consumer.load_balancer;
        BalanceConfig {
            policy: section.policy.clone(),
            enable_dynamic_weight: section.enable_dynamic_weight,
            vnode_count: section.vnode_count,
            hash_func: section.hash_func.clone(),
            maglev_table_size: section.maglev_table_size,
            compat_replicas: section.compat_replicas,
            ..BalanceConfig::default()
        }
    }

    pub fn lb_policy_for(&self, key: &ServiceKey) -> String {
        self.service_override(key)
            .and_then(|o| o.load_balancer_type.clone())
            .unwrap_or_else(|| self.consumer.load_balancer.policy.clone())
    }

    pub fn breaker_config(&self, key: Option<&ServiceKey>) -> BreakerConfig {
        let section = &self.consumer.circuit_breaker;
        let ec = &section.plugin.error_count;
        let er = &section.plugin.error_rate;
        let enabled = key
            .and_then(|key| self.service_override(key))
            .and_then(|o| o.circuit_breaker_enable)
            .unwrap_or(section.enable);
        BreakerConfig {
            enabled,
            chain: section.chain.clone(),
            check_period_ms: section.check_period,
            error_count: ErrorCountConfig {
                continuous_threshold: ec.continuous_error_threshold,
                sleep_window_ms: ec.sleep_window,
                request_after_half_open: ec.request_count_after_half_open,
                success_count_to_close: ec.success_count_after_half_open,
                metric_expired_ms: ec.metric_expired_time,
            },
            error_rate: ErrorRateConfig {
                window_ms: er.metric_stat_time_window,
                num_buckets: er.metric_num_buckets,
                request_volume_threshold: er.request_volume_threshold,
                error_rate_threshold: er.error_rate_threshold,
                preserve_threshold: er.preserve_threshold,
                sleep_window_ms: er.sleep_window,
                request_after_half_open: er.request_count_after_half_open,
                success_count_to_close: er.success_count_after_half_open,
                metric_expired_ms: er.metric_expired_time,
            },
            ..BreakerConfig::default()
        }
    }

    pub fn health_config(&self, key: Option<&ServiceKey>) -> Result<HealthCheckConfig> {
        let section = &self.consumer.health_check;
        let when = key
            .and_then(|key| self.service_override(key))
            .and_then(|o| o.health_check_when.clone())
            .unwrap_or_else(|| section.when.clone());
        Ok(HealthCheckConfig {
            when: parse_probe_when(&when)?,
            interval_ms: section.interval,
            timeout_ms: section.timeout,
            chain: section.chain.clone(),
            tcp: mesh_registry_healthcheck::tcp::TcpProbeConfig {
                send: section.plugin.tcp.send.clone().into_bytes(),
                expect: section.plugin.tcp.receive.clone().into_bytes(),
            },
            http: mesh_registry_healthcheck::http::HttpProbeConfig {
                path: section.plugin.http.path.clone(),
            },
            udp: mesh_registry_healthcheck::udp::UdpProbeConfig {
                send: if section.plugin.udp.send.is_empty() {
                    b"ping".to_vec()
                } else {
                    section.plugin.udp.send.clone().into_bytes()
                },
                expect: section.plugin.udp.receive.clone().into_bytes(),
            },
        })
    }

    pub fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        let mode = match self.rate_limiter.mode.as_str() {
            "disable" => RateLimitMode::Disable,
            "local" => RateLimitMode::Local,
            "global" => RateLimitMode::Global,
            other => {
                return Err(RegistryError::with_detail(
                    ReturnCode::InvalidConfig,
                    format!("unknown rate limiter mode {other}"),
                ));
            }
        };
        Ok(RateLimitConfig {
            mode,
            cluster: self.rate_limiter.rate_limit_cluster.clone(),
            window_expire_ms: self.rate_limiter.window_expire_time,
            reconcile_interval_ms: self.rate_limiter.reconcile_interval,
            ..RateLimitConfig::default()
        })
    }
}
