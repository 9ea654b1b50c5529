use anyhow::{Context, Result, bail};
use power_control::{HardwareAddress, SshCredentials};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [target]
//                    host = "192.168.1.50"
//
//   env var:         IA_GATE_TARGET__HOST=192.168.1.50   (double underscore = nesting)
//
// A `.env` file in the working directory is loaded into the environment
// before the figment is built.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub target: TargetFileConfig,
    #[serde(default)]
    pub ssh: SshFileConfig,
    #[serde(default)]
    pub wake: WakeFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// The managed machine (lives under `[target]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetFileConfig {
    #[serde(default)]
    pub host: String,
    /// Hardware address used for Wake-on-LAN
    #[serde(default)]
    pub mac: String,
    /// Port of the inference service on the target
    #[serde(default = "default_service_port")]
    pub service_port: u16,
}

impl Default for TargetFileConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            mac: String::new(),
            service_port: default_service_port(),
        }
    }
}

/// Remote command credentials (lives under `[ssh]`). The port doubles as
/// the physical reachability probe port.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshFileConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub sudo_password: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SshFileConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            sudo_password: None,
            port: default_ssh_port(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for SshFileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshFileConfig")
            .field("user", &self.user)
            .field("password_set", &self.password.is_some())
            .field("sudo_password_set", &self.sudo_password.is_some())
            .field("port", &self.port)
            .field("identity_file", &self.identity_file)
            .finish_non_exhaustive()
    }
}

/// Wake-on-LAN broadcast destination (lives under `[wake]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WakeFileConfig {
    #[serde(default = "default_broadcast")]
    pub broadcast: String,
    #[serde(default = "default_wake_port")]
    pub port: u16,
}

impl Default for WakeFileConfig {
    fn default() -> Self {
        Self {
            broadcast: default_broadcast(),
            port: default_wake_port(),
        }
    }
}

/// Accepted API keys (lives under `[auth]`).
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// A list, or a single comma-separated string
    #[serde(default, deserialize_with = "string_or_list")]
    pub api_keys: Vec<String>,
}

impl std::fmt::Debug for AuthFileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFileConfig")
            .field("api_keys", &self.api_keys.len())
            .finish()
    }
}

/// Per-operation timeouts in seconds (lives under `[timeouts]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutsFileConfig {
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    #[serde(default = "default_service_check_secs")]
    pub service_check_secs: u64,
    #[serde(default = "default_list_models_secs")]
    pub list_models_secs: u64,
    #[serde(default = "default_metadata_secs")]
    pub metadata_secs: u64,
    #[serde(default = "default_generation_secs")]
    pub generation_secs: u64,
    #[serde(default = "default_pull_secs")]
    pub pull_secs: u64,
}

impl Default for TimeoutsFileConfig {
    fn default() -> Self {
        Self {
            probe_secs: default_probe_secs(),
            service_check_secs: default_service_check_secs(),
            list_models_secs: default_list_models_secs(),
            metadata_secs: default_metadata_secs(),
            generation_secs: default_generation_secs(),
            pull_secs: default_pull_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_service_port() -> u16 {
    11434
}
fn default_ssh_port() -> u16 {
    22
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_command_timeout_secs() -> u64 {
    20
}
fn default_broadcast() -> String {
    "255.255.255.255".to_string()
}
fn default_wake_port() -> u16 {
    9
}
fn default_probe_secs() -> u64 {
    2
}
fn default_service_check_secs() -> u64 {
    5
}
fn default_list_models_secs() -> u64 {
    10
}
fn default_metadata_secs() -> u64 {
    30
}
fn default_generation_secs() -> u64 {
    300
}
fn default_pull_secs() -> u64 {
    3600
}

fn string_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Keys {
        One(String),
        Many(Vec<String>),
    }

    let keys = match Keys::deserialize(d)? {
        Keys::One(s) => s.split(',').map(str::to_string).collect(),
        Keys::Many(v) => v,
    };
    Ok(keys
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}

const ENV_PREFIX: &str = "IA_GATE_";

/// Env keys taken verbatim. figment parses `0123` or `001122334455` as
/// numbers, which drops leading zeros and fails string fields.
const TEXT_ENV_KEYS: &[&str] = &[
    "server.host",
    "target.host",
    "target.mac",
    "ssh.user",
    "ssh.password",
    "ssh.sudo_password",
    "wake.broadcast",
    "auth.api_keys",
];

/// Build a figment that layers: defaults → config.toml → IA_GATE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `IA_GATE_TARGET__HOST=10.0.0.5`  →  `target.host = "10.0.0.5"`
///   `IA_GATE_AUTH__API_KEYS=a,b`     →  `auth.api_keys = ["a", "b"]`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let env = Env::prefixed(ENV_PREFIX).split("__");
    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(env.clone().ignore(TEXT_ENV_KEYS));

    for (key, value) in env.only(TEXT_ENV_KEYS).iter() {
        figment = figment.merge(Serialized::default(key.as_str(), value));
    }
    figment
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Where the managed machine lives and how to reach it.
#[derive(Clone, Debug)]
pub struct TargetConfig {
    pub host: String,
    pub mac: HardwareAddress,
    pub service_port: u16,
    /// Port used for the physical reachability probe
    pub probe_port: u16,
    pub broadcast: String,
    pub wake_port: u16,
}

impl TargetConfig {
    pub fn service_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.service_port)
    }
}

/// Operation timeouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Physical reachability probe
    pub probe: Duration,
    /// Logical probe of the inference service
    pub service_check: Duration,
    pub list_models: Duration,
    /// `show`, `delete`
    pub metadata: Duration,
    /// `generate`, `chat`
    pub generation: Duration,
    /// `pull`
    pub pull: Duration,
}

impl Timeouts {
    pub fn from_file(fc: &TimeoutsFileConfig) -> Self {
        Self {
            probe: Duration::from_secs(fc.probe_secs),
            service_check: Duration::from_secs(fc.service_check_secs),
            list_models: Duration::from_secs(fc.list_models_secs),
            metadata: Duration::from_secs(fc.metadata_secs),
            generation: Duration::from_secs(fc.generation_secs),
            pull: Duration::from_secs(fc.pull_secs),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_file(&TimeoutsFileConfig::default())
    }
}

/// Fully validated runtime configuration.
#[derive(Clone, Debug)]
pub struct GateConfig {
    pub target: TargetConfig,
    pub credentials: SshCredentials,
    pub api_keys: BTreeSet<String>,
    pub timeouts: Timeouts,
}

impl GateConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        if fc.target.host.trim().is_empty() {
            bail!("target host is not configured (set [target].host or IA_GATE_TARGET__HOST)");
        }
        if fc.target.mac.trim().is_empty() {
            bail!("target hardware address is not configured (set [target].mac)");
        }
        let mac: HardwareAddress = fc
            .target
            .mac
            .parse()
            .context("invalid [target].mac")?;

        Ok(Self {
            target: TargetConfig {
                host: fc.target.host.trim().to_string(),
                mac,
                service_port: fc.target.service_port,
                probe_port: fc.ssh.port,
                broadcast: fc.wake.broadcast.clone(),
                wake_port: fc.wake.port,
            },
            credentials: SshCredentials {
                user: fc.ssh.user.clone(),
                password: fc.ssh.password.clone(),
                sudo_password: fc.ssh.sudo_password.clone(),
                port: fc.ssh.port,
                identity_file: fc.ssh.identity_file.clone(),
                connect_timeout: Duration::from_secs(fc.ssh.connect_timeout_secs),
                command_timeout: Duration::from_secs(fc.ssh.command_timeout_secs),
            },
            api_keys: fc.auth.api_keys.iter().cloned().collect(),
            timeouts: Timeouts::from_file(&fc.timeouts),
        })
    }
}

// =============================================================================
// Directory layout config (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct GatePaths {
    pub data_dir: PathBuf,
    pub status_dir: PathBuf,
}

impl GatePaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".ia_gate"),
        };

        let status_dir = data_dir.join("status");
        std::fs::create_dir_all(&status_dir)
            .with_context(|| format!("Failed to create status directory: {:?}", status_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            status_dir,
        })
    }

    /// The persisted lifecycle record.
    pub fn state_file(&self) -> PathBuf {
        self.status_dir.join("status.json")
    }

    /// Optional template used when the record is first created.
    pub fn template_file(&self) -> PathBuf {
        self.status_dir.join("base.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
