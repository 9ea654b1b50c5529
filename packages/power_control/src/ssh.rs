//! `RemoteShell` backed by the system OpenSSH client.
//!
//! Opening a session starts a multiplexing master connection
//! (`ControlMaster`), so every command issued on the session reuses the
//! same authenticated transport. Password authentication goes through
//! `sshpass -e`, which reads the password from the environment rather
//! than from argv.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::ControlError;
use crate::power_off::{CommandOutput, RemoteSession, RemoteShell};

/// How long an idle master connection outlives its last client.
const CONTROL_PERSIST_SECS: u64 = 120;

/// `sshpass` exit status for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

#[derive(Clone)]
pub struct SshCredentials {
    pub user: String,
    pub password: Option<String>,
    /// Privilege-escalation secret; falls back to `password` when unset.
    pub sudo_password: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            sudo_password: None,
            port: 22,
            identity_file: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(20),
        }
    }
}

// Secrets stay out of logs and panics.
impl std::fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "sudo_password",
                &self.sudo_password.as_ref().map(|_| "<redacted>"),
            )
            .field("port", &self.port)
            .field("identity_file", &self.identity_file)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl SshCredentials {
    pub fn escalation_secret(&self) -> Option<&str> {
        self.sudo_password
            .as_deref()
            .or(self.password.as_deref())
            .filter(|s| !s.is_empty())
    }

    fn login_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|s| !s.is_empty())
    }
}

/// Opens sessions by spawning `ssh` (or `sshpass -e ssh`).
#[derive(Debug, Clone)]
pub struct SshShell {
    program: String,
    control_dir: PathBuf,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            control_dir: std::env::temp_dir(),
        }
    }
}

impl SshShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different ssh binary (for tests or non-standard installs).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn open(
        &self,
        host: &str,
        credentials: &SshCredentials,
    ) -> Result<Box<dyn RemoteSession>, ControlError> {
        if host.is_empty() || host.starts_with('-') {
            return Err(ControlError::Connection {
                host: host.to_string(),
                detail: "invalid host name".to_string(),
            });
        }

        let tag = uuid::Uuid::new_v4().simple().to_string();
        let session = SshSession {
            program: self.program.clone(),
            host: host.to_string(),
            credentials: credentials.clone(),
            control_path: self.control_dir.join(format!("pc-{}.sock", &tag[..12])),
            log_path: self.control_dir.join(format!("pc-{}.log", &tag[..12])),
        };

        // The master backgrounds itself after `true` completes. Its stdio
        // must not be piped or waiting on the child would block for as long
        // as the master lives, so diagnostics go to a log file instead.
        let mut cmd = session.command();
        cmd.args(["-o", "ControlMaster=yes"])
            .args(["-o", &format!("ControlPersist={}", CONTROL_PERSIST_SECS)])
            .arg("-E")
            .arg(&session.log_path)
            .arg(&session.host)
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let deadline = credentials.connect_timeout + Duration::from_secs(5);
        let status = match tokio::time::timeout(deadline, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(ControlError::Spawn {
                    program: session.launcher().to_string(),
                    source,
                });
            }
            Err(_) => {
                session.discard_log().await;
                return Err(ControlError::Connection {
                    host: host.to_string(),
                    detail: format!("no answer within {}s", deadline.as_secs()),
                });
            }
        };

        if status.success() {
            debug!("Opened ssh session to {}@{}", credentials.user, host);
            return Ok(Box::new(session));
        }

        let log = tokio::fs::read_to_string(&session.log_path)
            .await
            .unwrap_or_default();
        session.discard_log().await;

        let bad_password =
            credentials.login_password().is_some() && status.code() == Some(SSHPASS_BAD_PASSWORD);
        if bad_password || log.contains("Permission denied") {
            return Err(ControlError::Authentication {
                host: host.to_string(),
                user: credentials.user.clone(),
            });
        }

        let detail = log
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim().to_string())
            .unwrap_or_else(|| format!("ssh exited with {}", status));
        Err(ControlError::Connection {
            host: host.to_string(),
            detail,
        })
    }
}

struct SshSession {
    program: String,
    host: String,
    credentials: SshCredentials,
    control_path: PathBuf,
    log_path: PathBuf,
}

impl SshSession {
    fn launcher(&self) -> &str {
        if self.credentials.login_password().is_some() {
            "sshpass"
        } else {
            &self.program
        }
    }

    /// Common invocation: auth method, port, timeouts and control socket.
    fn command(&self) -> Command {
        let mut cmd = match self.credentials.login_password() {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(&self.program).env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.program);
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        cmd.args(["-p", &self.credentials.port.to_string()])
            .args(["-l", &self.credentials.user])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args([
                "-o",
                &format!(
                    "ConnectTimeout={}",
                    self.credentials.connect_timeout.as_secs().max(1)
                ),
            ])
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .kill_on_drop(true);

        if let Some(identity) = &self.credentials.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd
    }

    async fn discard_log(&self) {
        let _ = tokio::fs::remove_file(&self.log_path).await;
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(
        &mut self,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, ControlError> {
        let mut cmd = self.command();
        cmd.args(["-o", "ControlMaster=no"])
            .arg(&self.host)
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ControlError::Spawn {
            program: self.launcher().to_string(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                // The remote side may exit before reading; the exit status
                // tells the real story.
                debug!("Writing stdin to remote command failed: {}", e);
            }
        }

        let timeout = self.credentials.command_timeout;
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ControlError::CommandTimeout {
                secs: timeout.as_secs(),
            })?
            .map_err(|source| ControlError::Spawn {
                program: self.launcher().to_string(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn close(self: Box<Self>) {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(&self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match tokio::time::timeout(Duration::from_secs(5), cmd.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to stop ssh master for {}: {}", self.host, e),
            // Master may already be gone once the host starts shutting down
            Err(_) => debug!("Timed out stopping ssh master for {}", self.host),
        }
        self.discard_log().await;
    }
}
