//! HTTP prober: GET on a configured path, 2xx means healthy.
//!
//! The request is written directly over the TCP stream; a probe needs only
//! the status line, not a full client.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{HealthProber, ProbeError};

#[derive(Debug, Clone)]
pub struct HttpProbeConfig {
    pub path: String,
}

impl Default for HttpProbeConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
        }
    }
}

pub struct HttpProber {
    config: HttpProbeConfig,
}

impl HttpProber {
    pub const NAME: &'static str = "http";

    pub fn new(config: HttpProbeConfig) -> Self {
        Self { config }
    }

    fn parse_status(head: &str) -> Option<u16> {
        // "HTTP/1.1 200 OK"
        head.split_whitespace().nth(1)?.parse().ok()
    }
}

#[async_trait::async_trait]
impl HealthProber for HttpProber {
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
            let request = format!(
                "GET {} HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n\r\n",
                self.config.path, host, port
            );
            stream.write_all(request.as_bytes()).await?;
            stream.flush().await?;

            let mut buf = [0u8; 512];
            let mut head = Vec::new();
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
                if head.windows(2).any(|w| w == b"\r\n") || head.len() >= 512 {
                    break;
                }
            }
            let head = String::from_utf8_lossy(&head);
            let status = Self::parse_status(&head).ok_or(ProbeError::UnexpectedResponse)?;
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(ProbeError::BadStatus(status))
            }
        };
        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ProbeError::Timeout)?
    }
}
