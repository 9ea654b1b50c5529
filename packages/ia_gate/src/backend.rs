//! HTTP client for the inference service on the target machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::ProxyError;

/// Result of the logical probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceCheck {
    pub alive: bool,
    pub detail: String,
}

/// Checks whether the inference service answers. Failures are folded into
/// `alive = false`.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn check(&self) -> ServiceCheck;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    service_check_timeout: Duration,
    list_models_timeout: Duration,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        service_check_timeout: Duration,
        list_models_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_check_timeout,
            list_models_timeout,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Models installed on the backend.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ProxyError> {
        let resp = self
            .http
            .get(self.url("/api/tags"))
            .timeout(self.list_models_timeout)
            .send()
            .await
            .map_err(|e| ProxyError::from_reqwest(e, "list models"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::Upstream {
                status: Some(status),
                detail: format!("backend answered {} to list models: {}", status, body.trim()),
            });
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| ProxyError::from_reqwest(e, "list models"))?;
        Ok(tags.models)
    }
}

#[async_trait]
impl ServiceProbe for OllamaClient {
    async fn check(&self) -> ServiceCheck {
        let result = self
            .http
            .get(self.url("/api/tags"))
            .timeout(self.service_check_timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => ServiceCheck {
                alive: true,
                detail: "inference service answering".to_string(),
            },
            Ok(resp) => ServiceCheck {
                alive: false,
                detail: format!("inference service answered {}", resp.status()),
            },
            Err(e) => {
                debug!("Service check against {} failed: {}", self.base_url, e);
                ServiceCheck {
                    alive: false,
                    detail: "inference service not answering".to_string(),
                }
            }
        }
    }
}
