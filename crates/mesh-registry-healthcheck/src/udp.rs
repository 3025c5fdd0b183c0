//! UDP prober: send a datagram, optionally match the reply prefix.
//!
//! Without an expected reply the probe only validates that the datagram
//! could be sent, which catches unroutable hosts but not dead ones.

use std::time::Duration;

use tokio::net::UdpSocket;

use crate::{HealthProber, ProbeError};

#[derive(Debug, Clone)]
pub struct UdpProbeConfig {
    pub send: Vec<u8>,
    /// Expected reply prefix; empty means send-only.
    pub expect: Vec<u8>,
}

impl Default for UdpProbeConfig {
    fn default() -> Self {
        Self {
            send: b"ping".to_vec(),
            expect: Vec::new(),
        }
    }
}

pub struct UdpProber {
    config: UdpProbeConfig,
}

impl UdpProber {
    pub const NAME: &'static str = "udp";

    pub fn new(config: UdpProbeConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl HealthProber for UdpProber {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn probe(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        let run = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect((host, port)).await?;
            socket.send(&self.config.send).await?;
            if !self.config.expect.is_empty() {
                let mut reply = vec![0u8; self.config.expect.len().max(64)];
                let n = socket.recv(&mut reply).await?;
                if !reply[..n].starts_with(&self.config.expect) {
                    return Err(ProbeError::UnexpectedResponse);
                }
            }
            Ok(())
        };
        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ProbeError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });
        let prober = UdpProber::new(UdpProbeConfig {
            send: b"ping".to_vec(),
            expect: b"ping".to_vec(),
        });
        assert!(prober
            .probe("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn send_only_probe_succeeds() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let prober = UdpProber::new(UdpProbeConfig::default());
        assert!(prober
            .probe("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .is_ok());
        drop(server);
    }

    #[tokio::test]
    async fn wrong_reply_fails() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(b"other", peer).await.unwrap();
        });
        let prober = UdpProber::new(UdpProbeConfig {
            send: b"ping".to_vec(),
            expect: b"pong".to_vec(),
        });
        let err = prober
            .probe("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::UnexpectedResponse));
    }
}
