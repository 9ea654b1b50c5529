//! The single persisted lifecycle record.
//!
//! All mutation goes through [`StateStore::update`], which holds an async
//! mutex across read → mutate → write so concurrent wake/shutdown requests
//! can never lose a counter change. The record lives in one JSON file that
//! is replaced atomically (temp file + rename) on every write.
//!
//! The store assumes a single owning process; it does not take file locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_MESSAGE: &str = "Machine disconnected";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleState {
    /// Last observed reachability of the inference service
    #[serde(default)]
    pub logical_on: bool,
    /// Last observed reachability of the host
    #[serde(default, alias = "phisical_on")]
    pub physical_on: bool,
    /// Outstanding keep-on leases
    #[serde(default, alias = "peticions_ollama")]
    pub request_counter: u32,
    /// Suppresses automatic shutdown regardless of leases
    #[serde(default)]
    pub permanent_on: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now", alias = "datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            logical_on: false,
            physical_on: false,
            request_counter: 0,
            permanent_on: false,
            message: DEFAULT_MESSAGE.to_string(),
            updated_at: Utc::now(),
        }
    }
}

impl LifecycleState {
    /// Acquire one lease.
    pub fn acquire_lease(&mut self) -> u32 {
        self.request_counter = self.request_counter.saturating_add(1);
        self.request_counter
    }

    /// Release one lease, clamping at zero.
    pub fn release_lease(&mut self) -> u32 {
        self.request_counter = self.request_counter.saturating_sub(1);
        self.request_counter
    }

    /// Whether a conditional shutdown may power the machine off.
    pub fn should_power_off(&self) -> bool {
        self.request_counter < 1 && !self.permanent_on
    }

    pub fn mark_offline(&mut self) {
        self.physical_on = false;
        self.logical_on = false;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to {action} state file {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct StateStore {
    path: PathBuf,
    template: Option<PathBuf>,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            template: None,
            lock: Mutex::new(()),
        }
    }

    /// Use `template` (if it exists) as the initial record on first access.
    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record, creating it from the template if absent.
    pub async fn read(&self) -> Result<LifecycleState, StoreError> {
        let _guard = self.lock.lock().await;
        self.load_or_create().await
    }

    /// Replace the record. `updated_at` is set by the store.
    #[allow(dead_code)]
    pub async fn write(&self, mut state: LifecycleState) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let previous = self.load_or_create().await?;
        state.updated_at = next_timestamp(&previous);
        self.persist(&state).await
    }

    /// Serialized read → mutate → write. The mutator returns the message
    /// describing the transition, which is recorded on the state.
    pub async fn update<F>(&self, mutate: F) -> Result<LifecycleState, StoreError>
    where
        F: FnOnce(&mut LifecycleState) -> String,
    {
        let _guard = self.lock.lock().await;
        let mut state = self.load_or_create().await?;
        let previous_at = state.updated_at;

        state.message = mutate(&mut state);
        state.updated_at = Utc::now().max(previous_at);

        self.persist(&state).await?;
        debug!(
            "State updated: leases={} permanent={} physical={} logical={}",
            state.request_counter, state.permanent_on, state.physical_on, state.logical_on
        );
        Ok(state)
    }

    /// Caller must hold `lock`.
    async fn load_or_create(&self) -> Result<LifecycleState, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<LifecycleState>(&bytes) {
                Ok(state) => Ok(state),
                Err(e) => {
                    let aside = self.path.with_extension("json.corrupt");
                    warn!(
                        "State file {:?} is corrupt ({}); moving it to {:?} and starting fresh",
                        self.path, e, aside
                    );
                    tokio::fs::rename(&self.path, &aside)
                        .await
                        .map_err(|source| self.io_error("move aside", source))?;
                    self.create().await
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.create().await,
            Err(source) => Err(self.io_error("read", source)),
        }
    }

    async fn create(&self) -> Result<LifecycleState, StoreError> {
        let mut state = self.template_state().await;
        state.updated_at = Utc::now();
        self.persist(&state).await?;
        info!("Created state file {:?}", self.path);
        Ok(state)
    }

    async fn template_state(&self) -> LifecycleState {
        let Some(template) = &self.template else {
            return LifecycleState::default();
        };
        match tokio::fs::read(template).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Ignoring unreadable state template {:?}: {}", template, e);
                LifecycleState::default()
            }),
            Err(_) => LifecycleState::default(),
        }
    }

    async fn persist(&self, state: &LifecycleState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error("create directory for", source))?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|source| self.io_error("write", source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.io_error("replace", source))
    }

    fn io_error(&self, action: &'static str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            action,
            path: self.path.clone(),
            source,
        }
    }
}

fn next_timestamp(previous: &LifecycleState) -> DateTime<Utc> {
    Utc::now().max(previous.updated_at)
}
