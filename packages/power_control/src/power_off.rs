//! Remote power-off over a command session.
//!
//! The executor opens one session to the host and tries a privileged
//! shutdown first, feeding the escalation secret through the session's
//! stdin so it never shows up in a process listing. If that attempt does
//! not succeed it tries exactly one unprivileged shutdown on the same
//! session. There is no loop and no backoff.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::ControlError;
use crate::ssh::SshCredentials;

/// `sudo -S` reads the password from stdin, `-p ''` suppresses the prompt.
pub const PRIVILEGED_SHUTDOWN: &str = "sudo -S -p '' shutdown -h now";
pub const UNPRIVILEGED_SHUTDOWN: &str = "shutdown -h now";

/// Result of running one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the remote side went away without reporting a status
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn describe(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("exit {}", code),
            None => "no exit status".to_string(),
        };
        let mut parts = vec![status];
        if !self.stdout.trim().is_empty() {
            parts.push(format!("stdout: {}", self.stdout.trim()));
        }
        if !self.stderr.trim().is_empty() {
            parts.push(format!("stderr: {}", self.stderr.trim()));
        }
        parts.join(", ")
    }
}

/// An open command channel to a remote host.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run `command`, writing `stdin` (if any) to its standard input.
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, ControlError>;

    /// Release the session. Errors are logged, never returned.
    async fn close(self: Box<Self>);
}

/// Opens sessions.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn open(
        &self,
        host: &str,
        credentials: &SshCredentials,
    ) -> Result<Box<dyn RemoteSession>, ControlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOffMethod {
    Privileged,
    Unprivileged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerOffOutcome {
    /// The last method attempted
    pub method: PowerOffMethod,
    pub success: bool,
    pub detail: String,
}

#[async_trait]
pub trait PowerOffExecutor: Send + Sync {
    /// Fails with `Connection`/`Authentication` if the session cannot be
    /// opened. A session that opens but where both commands fail yields
    /// `Ok` with `success = false` and the combined diagnostics.
    async fn power_off(
        &self,
        host: &str,
        credentials: &SshCredentials,
    ) -> Result<PowerOffOutcome, ControlError>;
}

/// Power-off executor generic over the session transport.
pub struct ShellPowerOff<S> {
    shell: S,
}

impl<S: RemoteShell> ShellPowerOff<S> {
    pub fn new(shell: S) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl<S: RemoteShell> PowerOffExecutor for ShellPowerOff<S> {
    async fn power_off(
        &self,
        host: &str,
        credentials: &SshCredentials,
    ) -> Result<PowerOffOutcome, ControlError> {
        let mut session = self.shell.open(host, credentials).await?;

        let secret = credentials
            .escalation_secret()
            .map(|secret| format!("{}\n", secret));
        let privileged = attempt(session.as_mut(), PRIVILEGED_SHUTDOWN, secret.as_deref()).await;

        let outcome = match privileged {
            Ok(()) => {
                info!("Privileged shutdown accepted by {}", host);
                PowerOffOutcome {
                    method: PowerOffMethod::Privileged,
                    success: true,
                    detail: "privileged shutdown accepted".to_string(),
                }
            }
            Err(privileged_detail) => {
                warn!(
                    "Privileged shutdown on {} failed ({}), trying unprivileged",
                    host, privileged_detail
                );
                match attempt(session.as_mut(), UNPRIVILEGED_SHUTDOWN, None).await {
                    Ok(()) => {
                        info!("Unprivileged shutdown accepted by {}", host);
                        PowerOffOutcome {
                            method: PowerOffMethod::Unprivileged,
                            success: true,
                            detail: format!(
                                "unprivileged shutdown accepted after privileged attempt failed: {}",
                                privileged_detail
                            ),
                        }
                    }
                    Err(unprivileged_detail) => PowerOffOutcome {
                        method: PowerOffMethod::Unprivileged,
                        success: false,
                        detail: format!(
                            "privileged attempt: {}; unprivileged attempt: {}",
                            privileged_detail, unprivileged_detail
                        ),
                    },
                }
            }
        };

        session.close().await;
        Ok(outcome)
    }
}

/// Run one shutdown attempt, reducing any failure to a diagnostic string.
async fn attempt(
    session: &mut dyn RemoteSession,
    command: &str,
    stdin: Option<&str>,
) -> Result<(), String> {
    match session.exec(command, stdin).await {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => Err(output.describe()),
        Err(e) => Err(e.to_string()),
    }
}
