//! Connectivity diagnostics for `/debug`.
//!
//! Runs the platform ping against the target and reports the effective
//! configuration with every secret reduced to a "set" flag. Nothing here
//! feeds back into lifecycle decisions.

use power_control::{ConnectivityResult, Prober, SshCredentials};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{TargetConfig, Timeouts};

const PING_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub target_host: String,
    pub target_mac: String,
    pub service_port: u16,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_password_set: bool,
    pub ssh_sudo_password_set: bool,
    pub ssh_identity_file_set: bool,
    pub wake_broadcast: String,
    pub wake_port: u16,
    pub api_keys_configured: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugReport {
    pub os: &'static str,
    pub arch: &'static str,
    pub version: &'static str,
    pub config: ConfigSummary,
    pub probe: ConnectivityResult,
    pub ping: PingResult,
}

pub struct Diagnostics {
    summary: ConfigSummary,
    host: String,
    probe_port: u16,
    probe_timeout: Duration,
    prober: Arc<dyn Prober>,
    ping_program: String,
}

impl Diagnostics {
    pub fn new(
        target: &TargetConfig,
        credentials: &SshCredentials,
        api_keys: usize,
        timeouts: &Timeouts,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let is_set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        Self {
            summary: ConfigSummary {
                target_host: target.host.clone(),
                target_mac: target.mac.to_string(),
                service_port: target.service_port,
                ssh_port: credentials.port,
                ssh_user: credentials.user.clone(),
                ssh_password_set: is_set(&credentials.password),
                ssh_sudo_password_set: is_set(&credentials.sudo_password),
                ssh_identity_file_set: credentials.identity_file.is_some(),
                wake_broadcast: target.broadcast.clone(),
                wake_port: target.wake_port,
                api_keys_configured: api_keys,
            },
            host: target.host.clone(),
            probe_port: target.probe_port,
            probe_timeout: timeouts.probe,
            prober,
            ping_program: "ping".to_string(),
        }
    }

    pub fn with_ping_program(mut self, program: impl Into<String>) -> Self {
        self.ping_program = program.into();
        self
    }

    pub async fn report(&self) -> DebugReport {
        let probe = self
            .prober
            .probe(&self.host, self.probe_port, self.probe_timeout)
            .await;
        let ping = self.ping().await;

        DebugReport {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            version: env!("CARGO_PKG_VERSION"),
            config: self.summary.clone(),
            probe,
            ping,
        }
    }

    async fn ping(&self) -> PingResult {
        let args = ping_args(&self.host);
        let command = format!("{} {}", self.ping_program, args.join(" "));
        debug!("Running {}", command);

        let mut cmd = tokio::process::Command::new(&self.ping_program);
        cmd.args(&args).kill_on_drop(true);
        let run = cmd.output();

        let failed = |error: String| PingResult {
            command: command.clone(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
        };

        match tokio::time::timeout(PING_DEADLINE, run).await {
            Ok(Ok(output)) => PingResult {
                command: command.clone(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                error: None,
            },
            Ok(Err(e)) => failed(format!("failed to run {}: {}", self.ping_program, e)),
            Err(_) => failed(format!(
                "ping did not finish within {}s",
                PING_DEADLINE.as_secs()
            )),
        }
    }
}

fn ping_args(host: &str) -> Vec<String> {
    if cfg!(windows) {
        vec!["-n".into(), "1".into(), "-w".into(), "2000".into(), host.into()]
    } else {
        vec!["-c".into(), "1".into(), "-W".into(), "2".into(), host.into()]
    }
}
