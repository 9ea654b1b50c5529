use power_control::{
    ConnectivityResult, PowerOffExecutor, PowerOffMethod, Prober, SshCredentials, WakeSignaler,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backend::ServiceProbe;
use crate::config::TargetConfig;
use crate::error::LifecycleError;
use crate::metrics::ServerMetrics;
use crate::state_store::{LifecycleState, StateStore};

/// External collaborators the coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub prober: Arc<dyn Prober>,
    pub service: Arc<dyn ServiceProbe>,
    pub waker: Arc<dyn WakeSignaler>,
    pub power: Arc<dyn PowerOffExecutor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WakeReport {
    pub success: bool,
    pub message: String,
    /// Whether a magic packet went out
    pub packet_sent: bool,
    /// Reachability observed before acting; not a wake confirmation
    pub reachable: bool,
    pub leases: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub success: bool,
    pub message: String,
    pub powered_off: bool,
    pub already_off: bool,
    pub leases: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<PowerOffMethod>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermanentReport {
    pub success: bool,
    pub message: String,
    pub permanent_on: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub host_online: bool,
    pub service_online: bool,
    pub message: String,
    pub state: LifecycleState,
}

pub struct Coordinator {
    store: Arc<StateStore>,
    parts: Collaborators,
    target: TargetConfig,
    credentials: SshCredentials,
    probe_timeout: Duration,
    metrics: Arc<ServerMetrics>,
    /// Held across wake and shutdown transitions. The flag is set once a
    /// power-off was accepted and cleared when a probe finds the host down.
    power_off_pending: Mutex<bool>,
}

impl Coordinator {
    pub fn new(
        store: Arc<StateStore>,
        parts: Collaborators,
        target: TargetConfig,
        credentials: SshCredentials,
        probe_timeout: Duration,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            store,
            parts,
            target,
            credentials,
            probe_timeout,
            metrics,
            power_off_pending: Mutex::new(false),
        }
    }

    /// Fresh physical probe of the target host.
    pub async fn probe_host(&self) -> ConnectivityResult {
        self.parts
            .prober
            .probe(&self.target.host, self.target.probe_port, self.probe_timeout)
            .await
    }

    /// Pure snapshot of the stored record.
    pub async fn status(&self) -> Result<LifecycleState, LifecycleError> {
        Ok(self.store.read().await?)
    }

    /// Acquire a lease, sending a wake packet if the host is down.
    ///
    /// Does not wait for the machine to come up.
    pub async fn wake(&self) -> Result<WakeReport, LifecycleError> {
        let mut pending = self.power_off_pending.lock().await;
        let probe = self.probe_host().await;
        if !probe.reachable {
            *pending = false;
        }

        // A host that accepted a power-off still answers while it goes down
        if probe.reachable && !*pending {
            let state = self
                .store
                .update(|s| {
                    s.physical_on = true;
                    let leases = s.acquire_lease();
                    format!("Machine already online, lease acquired. Leases: {}", leases)
                })
                .await?;
            self.metrics.lease_acquired(false);
            info!(
                "Wake: {} already online, leases now {}",
                probe.target, state.request_counter
            );
            return Ok(WakeReport {
                success: true,
                message: state.message,
                packet_sent: false,
                reachable: true,
                leases: state.request_counter,
            });
        }

        if *pending {
            info!(
                "Wake: {} is still shutting down, sending packet anyway",
                probe.target
            );
        }

        let outcome = match self
            .parts
            .waker
            .wake(&self.target.mac, &self.target.broadcast, self.target.wake_port)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Wake packet for {} not sent: {}", self.target.mac, e);
                self.note(format!("Wake failed: {}", e)).await;
                return Err(LifecycleError::Transmission(e));
            }
        };

        let state = self
            .store
            .update(|s| {
                let leases = s.acquire_lease();
                format!(
                    "Wake packet sent to {} via {}. Leases: {}",
                    outcome.hardware_address, outcome.destination, leases
                )
            })
            .await?;
        self.metrics.lease_acquired(true);
        info!(
            "Wake: packet sent to {}, leases now {}",
            outcome.hardware_address, state.request_counter
        );

        Ok(WakeReport {
            success: true,
            message: state.message,
            packet_sent: true,
            reachable: probe.reachable,
            leases: state.request_counter,
        })
    }

    /// Release a lease; power off when no leases remain and permanent
    /// mode is off.
    pub async fn conditional_shutdown(&self) -> Result<ShutdownReport, LifecycleError> {
        let mut pending = self.power_off_pending.lock().await;
        let probe = self.probe_host().await;

        if !probe.reachable {
            *pending = false;
            let state = self
                .store
                .update(|s| {
                    s.mark_offline();
                    let leases = s.release_lease();
                    format!("Machine already off. Leases: {}", leases)
                })
                .await?;
            self.metrics.lease_released();
            info!("Shutdown: {} already unreachable", probe.target);
            return Ok(ShutdownReport {
                success: true,
                message: state.message,
                powered_off: false,
                already_off: true,
                leases: state.request_counter,
                method: None,
            });
        }

        let state = self
            .store
            .update(|s| {
                s.physical_on = true;
                let leases = s.release_lease();
                if s.permanent_on {
                    format!(
                        "Lease released; permanent mode keeps the machine on. Leases: {}",
                        leases
                    )
                } else if leases > 0 {
                    format!(
                        "Lease released; machine stays on for other users. Leases: {}",
                        leases
                    )
                } else {
                    "Last lease released, powering off".to_string()
                }
            })
            .await?;
        self.metrics.lease_released();

        if !state.should_power_off() {
            info!(
                "Shutdown: keeping machine on (leases={}, permanent={})",
                state.request_counter, state.permanent_on
            );
            return Ok(ShutdownReport {
                success: true,
                message: state.message,
                powered_off: false,
                already_off: false,
                leases: state.request_counter,
                method: None,
            });
        }

        let outcome = self.execute_power_off().await;
        match outcome {
            Ok((method, detail)) => {
                *pending = true;
                let state = self
                    .store
                    .update(|s| {
                        s.mark_offline();
                        format!("Power-off accepted ({}): {}", method_name(method), detail)
                    })
                    .await?;
                Ok(ShutdownReport {
                    success: true,
                    message: state.message,
                    powered_off: true,
                    already_off: false,
                    leases: state.request_counter,
                    method: Some(method),
                })
            }
            Err(e) => {
                self.note(format!("Power-off failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Power off now regardless of leases. Leases and permanent mode are
    /// cleared whatever the outcome; the reachability flags only change on
    /// confirmed success.
    pub async fn forced_shutdown(&self) -> Result<ShutdownReport, LifecycleError> {
        let mut pending = self.power_off_pending.lock().await;
        let probe = self.probe_host().await;

        if !probe.reachable {
            *pending = false;
            let state = self
                .store
                .update(|s| {
                    s.request_counter = 0;
                    s.permanent_on = false;
                    s.mark_offline();
                    "Forced shutdown: machine already off, leases cleared".to_string()
                })
                .await?;
            info!("Forced shutdown: {} already unreachable", probe.target);
            return Ok(ShutdownReport {
                success: true,
                message: state.message,
                powered_off: false,
                already_off: true,
                leases: 0,
                method: None,
            });
        }

        let outcome = self.execute_power_off().await;
        if outcome.is_ok() {
            *pending = true;
        }
        let state = self
            .store
            .update(|s| {
                s.request_counter = 0;
                s.permanent_on = false;
                match &outcome {
                    Ok((method, detail)) => {
                        s.mark_offline();
                        format!(
                            "Forced shutdown accepted ({}): {}",
                            method_name(*method),
                            detail
                        )
                    }
                    Err(e) => format!("Forced shutdown failed, leases cleared: {}", e),
                }
            })
            .await?;

        let (method, _) = outcome?;
        Ok(ShutdownReport {
            success: true,
            message: state.message,
            powered_off: true,
            already_off: false,
            leases: state.request_counter,
            method: Some(method),
        })
    }

    pub async fn set_permanent(&self, enabled: bool) -> Result<PermanentReport, LifecycleError> {
        let state = self
            .store
            .update(|s| {
                s.permanent_on = enabled;
                if enabled {
                    "Permanent mode enabled".to_string()
                } else {
                    "Permanent mode disabled".to_string()
                }
            })
            .await?;
        info!("Permanent mode set to {}", enabled);

        Ok(PermanentReport {
            success: true,
            message: state.message,
            permanent_on: state.permanent_on,
        })
    }

    /// Probe host and service independently and record both flags. With
    /// `reset`, leases and permanent mode are cleared as a cold start.
    pub async fn refresh_status(&self, reset: bool) -> Result<StatusReport, LifecycleError> {
        let probe = self.probe_host().await;
        let (service_online, detail) = if probe.reachable {
            let check = self.parts.service.check().await;
            let detail = if check.alive {
                "Machine online, inference service answering".to_string()
            } else {
                format!("Machine online, {}", check.detail)
            };
            (check.alive, detail)
        } else {
            (false, "Machine disconnected".to_string())
        };

        let state = self
            .store
            .update(|s| {
                s.physical_on = probe.reachable;
                s.logical_on = service_online;
                if reset {
                    s.request_counter = 0;
                    s.permanent_on = false;
                    format!("{} (state reset)", detail)
                } else {
                    detail.clone()
                }
            })
            .await?;

        Ok(StatusReport {
            host_online: probe.reachable,
            service_online,
            message: detail,
            state,
        })
    }

    /// Run the executor and reduce its result to method/detail or an error.
    async fn execute_power_off(&self) -> Result<(PowerOffMethod, String), LifecycleError> {
        let result = self
            .parts
            .power
            .power_off(&self.target.host, &self.credentials)
            .await;

        match result {
            Ok(outcome) if outcome.success => {
                self.metrics.power_off_attempted(true);
                info!(
                    "Power-off of {} accepted via {} command",
                    self.target.host,
                    method_name(outcome.method)
                );
                Ok((outcome.method, outcome.detail))
            }
            Ok(outcome) => {
                self.metrics.power_off_attempted(false);
                warn!("Power-off of {} failed: {}", self.target.host, outcome.detail);
                Err(LifecycleError::CommandFailure(outcome.detail))
            }
            Err(e) => {
                self.metrics.power_off_attempted(false);
                warn!("Could not open session to {}: {}", self.target.host, e);
                Err(LifecycleError::Connection(e))
            }
        }
    }

    /// Record a diagnostic message without touching any other field.
    async fn note(&self, message: String) {
        if let Err(e) = self.store.update(|_| message).await {
            error!("Failed to record lifecycle message: {}", e);
        }
    }
}

fn method_name(method: PowerOffMethod) -> &'static str {
    match method {
        PowerOffMethod::Privileged => "privileged",
        PowerOffMethod::Unprivileged => "unprivileged",
    }
}
