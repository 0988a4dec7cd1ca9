//! Malware scanning collaborator.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use clamav_client::{clean, Tcp};
use thiserror::Error;

use crate::config::ScannerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected { signature: String },
}

/// Every scanner failure is transient from the pipeline's point of view.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Scanner unavailable: {0}")]
    Unavailable(String),
    #[error("Unreadable scanner response: {0}")]
    Protocol(String),
    #[error("Scan timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, data: &[u8]) -> Result<ScanVerdict, ScanError>;
}

/// ClamAV daemon reached over TCP (INSTREAM).
#[derive(Debug, Clone)]
pub struct ClamdScanner {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ClamdScanner {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            host: config.clamav_host.clone(),
            port: config.clamav_port,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Pull the signature name out of a `stream: Eicar-Signature FOUND` reply.
fn signature_from_response(response: &[u8]) -> String {
    let text = std::str::from_utf8(response).unwrap_or("").trim();
    text.split(':')
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .filter(|name| *name != "FOUND")
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl Scanner for ClamdScanner {
    async fn scan(&self, data: &[u8]) -> Result<ScanVerdict, ScanError> {
        let start = Instant::now();
        let data = data.to_vec();
        let address = format!("{}:{}", self.host, self.port);

        // The client is synchronous; keep it off the runtime threads.
        let scan = tokio::task::spawn_blocking(move || {
            let connection = Tcp {
                host_address: address.as_str(),
            };
            let response = clamav_client::scan_buffer(data.as_slice(), connection, None)
                .map_err(|e| ScanError::Unavailable(e.to_string()))?;
            let is_clean = clean(&response).map_err(|e| ScanError::Protocol(e.to_string()))?;
            Ok(if is_clean {
                ScanVerdict::Clean
            } else {
                ScanVerdict::Infected {
                    signature: signature_from_response(&response),
                }
            })
        });

        let verdict = match tokio::time::timeout(self.timeout, scan).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(ScanError::Unavailable(format!("scan task failed: {e}"))),
            Err(_) => return Err(ScanError::Timeout(self.timeout)),
        };

        match &verdict {
            ScanVerdict::Clean => tracing::debug!(
                duration_ms = start.elapsed().as_millis() as u64,
                "Scan completed: clean"
            ),
            ScanVerdict::Infected { signature } => tracing::warn!(
                duration_ms = start.elapsed().as_millis() as u64,
                signature = %signature,
                "Scan detected malware"
            ),
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_parsed_from_found_reply() {
        assert_eq!(
            signature_from_response(b"stream: Win.Test.EICAR_HDB-1 FOUND\0"),
            "Win.Test.EICAR_HDB-1"
        );
        assert_eq!(signature_from_response(b"garbage"), "unknown");
        assert_eq!(signature_from_response(b"stream: FOUND"), "unknown");
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_error() {
        let scanner = ClamdScanner::new(&ScannerConfig {
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 1,
            timeout_secs: 5,
        });
        assert!(scanner.scan(b"hello").await.is_err());
    }
}
