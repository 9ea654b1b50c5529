//! Transport-layer reachability probing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Outcome of a single reachability probe. Ephemeral: consumed by one
/// decision and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityResult {
    pub reachable: bool,
    pub probed_at: DateTime<Utc>,
    /// `host:port` that was probed
    pub target: String,
}

impl ConnectivityResult {
    pub fn new(host: &str, port: u16, reachable: bool) -> Self {
        Self {
            reachable,
            probed_at: Utc::now(),
            target: format!("{}:{}", host, port),
        }
    }
}

/// Answers "is the target reachable".
///
/// Implementations must return within `timeout` plus a small overhead and
/// must never fail: refusal, timeout, resolution errors and anything else
/// collapse to `reachable = false`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> ConnectivityResult;
}

/// Probes by opening (and immediately dropping) a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> ConnectivityResult {
        // The deadline covers name resolution as well as the handshake.
        let reachable = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await
        {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("Probe {}:{} failed: {}", host, port, e);
                false
            }
            Err(_) => {
                debug!("Probe {}:{} timed out after {:?}", host, port, timeout);
                false
            }
        };
        ConnectivityResult::new(host, port, reachable)
    }
}
