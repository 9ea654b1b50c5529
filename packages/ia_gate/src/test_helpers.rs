use async_trait::async_trait;
use power_control::{
    ConnectivityResult, ControlError, HardwareAddress, PowerOffExecutor, PowerOffMethod,
    PowerOffOutcome, Prober, SshCredentials, WakeOutcome, WakeSignaler,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::AppState;
use crate::auth::AuthState;
use crate::backend::{OllamaClient, ServiceCheck, ServiceProbe};
use crate::config::{TargetConfig, Timeouts};
use crate::diagnostics::Diagnostics;
use crate::lifecycle::{Collaborators, Coordinator};
use crate::metrics::ServerMetrics;
use crate::proxy::InferenceProxy;
use crate::state_store::{LifecycleState, StateStore};

pub const TEST_API_KEY: &str = "test-key";

pub fn test_target() -> TargetConfig {
    TargetConfig {
        host: "127.0.0.1".into(),
        mac: HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
        service_port: 11434,
        probe_port: 22,
        broadcast: "255.255.255.255".into(),
        wake_port: 9,
    }
}

// =============================================================================
// Fake collaborators
// =============================================================================

#[derive(Default)]
pub struct FakeProber {
    reachable: AtomicBool,
    probes: AtomicUsize,
}

impl FakeProber {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, host: &str, port: u16, _timeout: Duration) -> ConnectivityResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        ConnectivityResult::new(host, port, self.reachable.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct FakeService {
    alive: AtomicBool,
    checks: AtomicUsize,
}

impl FakeService {
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceProbe for FakeService {
    async fn check(&self) -> ServiceCheck {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let alive = self.alive.load(Ordering::SeqCst);
        ServiceCheck {
            alive,
            detail: if alive {
                "inference service answering".into()
            } else {
                "inference service not answering".into()
            },
        }
    }
}

#[derive(Default)]
pub struct FakeWaker {
    failing: AtomicBool,
    sent: AtomicUsize,
}

impl FakeWaker {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WakeSignaler for FakeWaker {
    async fn wake(
        &self,
        target: &HardwareAddress,
        broadcast_address: &str,
        port: u16,
    ) -> Result<WakeOutcome, ControlError> {
        let destination = format!("{}:{}", broadcast_address, port);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlError::Transmission {
                target: destination,
                source: std::io::Error::other("network unreachable"),
            });
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(WakeOutcome {
            hardware_address: target.to_string(),
            destination,
            bytes_sent: 102,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Succeed,
    CommandFails,
    Unreachable,
}

pub struct FakePowerOff {
    mode: std::sync::Mutex<PowerMode>,
    delay: std::sync::Mutex<Duration>,
    calls: AtomicUsize,
}

impl Default for FakePowerOff {
    fn default() -> Self {
        Self {
            mode: std::sync::Mutex::new(PowerMode::Succeed),
            delay: std::sync::Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakePowerOff {
    pub fn set_mode(&self, mode: PowerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Make each power-off take this long, like a slow ssh session.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerOffExecutor for FakePowerOff {
    async fn power_off(
        &self,
        host: &str,
        _credentials: &SshCredentials,
    ) -> Result<PowerOffOutcome, ControlError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mode = *self.mode.lock().unwrap();
        match mode {
            PowerMode::Succeed => Ok(PowerOffOutcome {
                method: PowerOffMethod::Privileged,
                success: true,
                detail: "privileged shutdown accepted".into(),
            }),
            PowerMode::CommandFails => Ok(PowerOffOutcome {
                method: PowerOffMethod::Unprivileged,
                success: false,
                detail: "privileged attempt: exit 1; unprivileged attempt: exit 1".into(),
            }),
            PowerMode::Unreachable => Err(ControlError::Connection {
                host: host.to_string(),
                detail: "connection refused".into(),
            }),
        }
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// A coordinator wired to fakes over a temp-dir state store. Hold the rig
/// for the whole test so the temp dir outlives the store.
pub struct TestRig {
    pub prober: Arc<FakeProber>,
    pub service: Arc<FakeService>,
    pub waker: Arc<FakeWaker>,
    pub power: Arc<FakePowerOff>,
    pub metrics: Arc<ServerMetrics>,
    pub store: Arc<StateStore>,
    pub coordinator: Arc<Coordinator>,
    _tmp: tempfile::TempDir,
}

impl TestRig {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(tmp.path().join("status").join("status.json")));
        let prober = Arc::new(FakeProber::default());
        let service = Arc::new(FakeService::default());
        let waker = Arc::new(FakeWaker::default());
        let power = Arc::new(FakePowerOff::default());
        let metrics = Arc::new(ServerMetrics::new());

        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            Collaborators {
                prober: prober.clone(),
                service: service.clone(),
                waker: waker.clone(),
                power: power.clone(),
            },
            test_target(),
            SshCredentials::default(),
            Duration::from_millis(100),
            metrics.clone(),
        ));

        Self {
            prober,
            service,
            waker,
            power,
            metrics,
            store,
            coordinator,
            _tmp: tmp,
        }
    }

    /// Overwrite stored fields before exercising the coordinator.
    pub async fn set_state(&self, setup: impl FnOnce(&mut LifecycleState)) {
        self.store
            .update(|s| {
                setup(s);
                "test setup".to_string()
            })
            .await
            .unwrap();
    }

    pub fn proxy(&self, backend_url: &str, timeouts: Timeouts) -> InferenceProxy {
        let backend = Arc::new(OllamaClient::new(
            backend_url,
            timeouts.service_check,
            timeouts.list_models,
        ));
        InferenceProxy::new(
            backend,
            self.prober.clone(),
            test_target(),
            timeouts,
            self.metrics.clone(),
        )
    }

    /// Full `AppState` accepting [`TEST_API_KEY`], proxying to `backend_url`.
    pub fn app_state(&self, backend_url: &str) -> AppState {
        let timeouts = Timeouts::default();
        let diagnostics = Diagnostics::new(
            &test_target(),
            &SshCredentials::default(),
            1,
            &timeouts,
            self.prober.clone(),
        )
        .with_ping_program("true");

        AppState {
            coordinator: self.coordinator.clone(),
            proxy: Arc::new(self.proxy(backend_url, timeouts)),
            diagnostics: Arc::new(diagnostics),
            metrics: self.metrics.clone(),
            auth: AuthState::new([TEST_API_KEY.to_string()].into_iter().collect()),
        }
    }
}
