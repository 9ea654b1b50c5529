//! Server metrics for observability
//!
//! Counters for lifecycle actions and proxied traffic, exposed at `/metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::ProxyError;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Lifecycle metrics
    /// Magic packets transmitted
    pub wake_packets_sent: AtomicU64,
    /// Leases taken (wake requests that succeeded)
    pub leases_acquired: AtomicU64,
    /// Leases given back by conditional shutdowns
    pub leases_released: AtomicU64,

    // Power-off metrics
    pub power_off_attempts: AtomicU64,
    pub power_off_successes: AtomicU64,
    pub power_off_failures: AtomicU64,

    // Proxy metrics
    /// Requests forwarded to the inference backend
    pub proxied_requests: AtomicU64,
    pub proxy_unavailable: AtomicU64,
    pub proxy_timeouts: AtomicU64,
    pub proxy_upstream_errors: AtomicU64,
    pub proxy_invalid_requests: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Lifecycle tracking
    pub fn lease_acquired(&self, packet_sent: bool) {
        self.leases_acquired.fetch_add(1, Ordering::Relaxed);
        if packet_sent {
            self.wake_packets_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn lease_released(&self) {
        self.leases_released.fetch_add(1, Ordering::Relaxed);
    }

    // Power-off tracking
    pub fn power_off_attempted(&self, succeeded: bool) {
        self.power_off_attempts.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.power_off_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.power_off_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Proxy tracking
    pub fn request_proxied(&self) {
        self.proxied_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proxy_error(&self, err: &ProxyError) {
        let counter = match err {
            ProxyError::ServiceUnavailable { .. } => &self.proxy_unavailable,
            ProxyError::GatewayTimeout(_) => &self.proxy_timeouts,
            ProxyError::Upstream { .. } => &self.proxy_upstream_errors,
            ProxyError::InvalidRequest(_) => &self.proxy_invalid_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            lifecycle: LifecycleMetrics {
                wake_packets_sent: self.wake_packets_sent.load(Ordering::Relaxed),
                leases_acquired: self.leases_acquired.load(Ordering::Relaxed),
                leases_released: self.leases_released.load(Ordering::Relaxed),
            },
            power_off: PowerOffMetrics {
                attempts: self.power_off_attempts.load(Ordering::Relaxed),
                successes: self.power_off_successes.load(Ordering::Relaxed),
                failures: self.power_off_failures.load(Ordering::Relaxed),
            },
            proxy: ProxyMetrics {
                requests: self.proxied_requests.load(Ordering::Relaxed),
                errors: ProxyErrorMetrics {
                    service_unavailable: self.proxy_unavailable.load(Ordering::Relaxed),
                    gateway_timeout: self.proxy_timeouts.load(Ordering::Relaxed),
                    upstream: self.proxy_upstream_errors.load(Ordering::Relaxed),
                    invalid_request: self.proxy_invalid_requests.load(Ordering::Relaxed),
                },
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub lifecycle: LifecycleMetrics,
    pub power_off: PowerOffMetrics,
    pub proxy: ProxyMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleMetrics {
    pub wake_packets_sent: u64,
    pub leases_acquired: u64,
    pub leases_released: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerOffMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyMetrics {
    pub requests: u64,
    pub errors: ProxyErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyErrorMetrics {
    pub service_unavailable: u64,
    pub gateway_timeout: u64,
    pub upstream: u64,
    pub invalid_request: u64,
}
