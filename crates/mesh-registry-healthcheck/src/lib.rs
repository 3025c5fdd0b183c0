//! Active health probing.
//!
//! A per-service ordered list of probers checks candidate instances over
//! TCP, HTTP or UDP. The chain short-circuits on the first successful
//! probe; if every prober fails the chain reports failure. A single probe
//! decides — there are no retries at this layer.
//!
//! Activation is gated by [`ProbeWhen`]: `Never` leaves the chain inert,
//! `OnRecover` probes only circuit-open instances (success requests a
//! half-open promotion), `Always` probes every non-isolated instance and
//! drives open/closed transitions directly.

use std::time::Duration;

use thiserror::Error;

use mesh_registry_core::{CircuitState, RegistryError, Result, ReturnCode};

pub mod http;
pub mod tcp;
pub mod udp;

pub use http::HttpProber;
pub use tcp::TcpProber;
pub use udp::UdpProber;

/// When the prober chain is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProbeWhen {
    #[default]
    Never,
    OnRecover,
    Always,
}

impl ProbeWhen {
    /// Whether an instance in the given circuit state should be probed.
    /// Isolated instances are never probed.
    pub fn should_probe(self, state: CircuitState, isolated: bool) -> bool {
        if isolated {
            return false;
        }
        match self {
            ProbeWhen::Never => false,
            ProbeWhen::OnRecover => state == CircuitState::Open,
            ProbeWhen::Always => true,
        }
    }
}

/// Probe failure causes.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error("http status {0}")]
    BadStatus(u16),
}

/// A single prober. One probe decides; the chain handles fallbacks.
#[async_trait::async_trait]
pub trait HealthProber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> std::result::Result<(), ProbeError>;
}

/// Assembled health-check configuration for one service.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub when: ProbeWhen,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Prober names, in chain order.
    pub chain: Vec<String>,
    pub tcp: tcp::TcpProbeConfig,
    pub http: http::HttpProbeConfig,
    pub udp: udp::UdpProbeConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            when: ProbeWhen::Never,
            interval_ms: 10_000,
            timeout_ms: 500,
            chain: vec![TcpProber::NAME.to_string()],
            tcp: tcp::TcpProbeConfig::default(),
            http: http::HttpProbeConfig::default(),
            udp: udp::UdpProbeConfig::default(),
        }
    }
}

/// Ordered prober chain; first success wins.
pub struct HealthCheckChain {
    probers: Vec<Box<dyn HealthProber>>,
    timeout: Duration,
}

impl std::fmt::Debug for HealthCheckChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckChain")
            .field("probers", &self.probers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HealthCheckChain {
    pub fn new(config: &HealthCheckConfig) -> Result<Self> {
        let mut probers: Vec<Box<dyn HealthProber>> = Vec::new();
        for name in &config.chain {
            match name.as_str() {
                TcpProber::NAME => probers.push(Box::new(TcpProber::new(config.tcp.clone()))),
                HttpProber::NAME => probers.push(Box::new(HttpProber::new(config.http.clone()))),
                UdpProber::NAME => probers.push(Box::new(UdpProber::new(config.udp.clone()))),
                other => {
                    return Err(RegistryError::with_detail(
                        ReturnCode::PluginError,
                        format!("unknown health checker {other}"),
                    ));
                }
            }
        }
        Ok(Self {
            probers,
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.probers.is_empty()
    }

    /// Probes through the chain; true as soon as any prober succeeds.
    pub async fn check(&self, host: &str, port: u16) -> bool {
        for prober in &self.probers {
            match prober.probe(host, port, self.timeout).await {
                Ok(()) => return true,
                Err(err) => {
                    tracing::debug!(
                        prober = prober.name(),
                        host,
                        port,
                        error = %err,
                        "probe failed"
                    );
                }
            }
        }
        false
    }
}
