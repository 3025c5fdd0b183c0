//! TCP prober: connect, optionally send a byte string and match the reply
//! prefix.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{HealthProber, ProbeError};

#[derive(Debug, Clone, Default)]
pub struct TcpProbeConfig {
    /// Bytes written after connect; empty means connect-only.
    pub send: Vec<u8>,
    /// Expected reply prefix; empty means no read.
    pub expect: Vec<u8>,
}

pub struct TcpProber {
    config: TcpProbeConfig,
}

impl TcpProber {
    pub const NAME: &'static str = "tcp";

    pub fn new(config: TcpProbeConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl HealthProber for TcpProber {
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
            let mut stream = TcpStream::connect((host, port)).await?;
            if !self.config.send.is_empty() {
                stream.write_all(&self.config.send).await?;
                stream.flush().await?;
            }
            if !self.config.expect.is_empty() {
                let mut reply = vec![0u8; self.config.expect.len()];
                stream.read_exact(&mut reply).await?;
                if reply != self.config.expect {
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
