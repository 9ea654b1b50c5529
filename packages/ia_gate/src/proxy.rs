//! Reachability-gated reverse proxy to the inference service.
//!
//! Every call probes the host first; if it is down the backend is never
//! contacted. The proxy does not touch the lease counter.

use axum::{
    Json,
    body::{Body, Bytes},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream::BoxStream};
use power_control::Prober;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{ModelInfo, OllamaClient};
use crate::config::{TargetConfig, Timeouts};
use crate::error::ProxyError;
use crate::metrics::ServerMetrics;

const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceOp {
    Generate,
    Chat,
    Pull,
    Delete,
    Show,
}

impl InferenceOp {
    pub const ALL: [InferenceOp; 5] = [
        InferenceOp::Generate,
        InferenceOp::Chat,
        InferenceOp::Pull,
        InferenceOp::Delete,
        InferenceOp::Show,
    ];

    pub fn name(self) -> &'static str {
        match self {
            InferenceOp::Generate => "generate",
            InferenceOp::Chat => "chat",
            InferenceOp::Pull => "pull",
            InferenceOp::Delete => "delete",
            InferenceOp::Show => "show",
        }
    }

    pub fn backend_path(self) -> &'static str {
        match self {
            InferenceOp::Generate => "/api/generate",
            InferenceOp::Chat => "/api/chat",
            InferenceOp::Pull => "/api/pull",
            InferenceOp::Delete => "/api/delete",
            InferenceOp::Show => "/api/show",
        }
    }

    pub fn method(self) -> reqwest::Method {
        match self {
            InferenceOp::Delete => reqwest::Method::DELETE,
            _ => reqwest::Method::POST,
        }
    }

    pub fn timeout(self, timeouts: &Timeouts) -> Duration {
        match self {
            InferenceOp::Generate | InferenceOp::Chat => timeouts.generation,
            InferenceOp::Pull => timeouts.pull,
            InferenceOp::Delete | InferenceOp::Show => timeouts.metadata,
        }
    }

    pub fn streaming_capable(self) -> bool {
        matches!(
            self,
            InferenceOp::Generate | InferenceOp::Chat | InferenceOp::Pull
        )
    }

    /// Stream mode when the request does not say.
    pub fn default_stream(self) -> bool {
        matches!(self, InferenceOp::Pull)
    }

    /// Model identifier fields accepted for this operation, in lookup order.
    fn model_fields(self) -> &'static [&'static str] {
        match self {
            InferenceOp::Generate | InferenceOp::Chat => &["model"],
            InferenceOp::Pull | InferenceOp::Delete | InferenceOp::Show => &["name", "model"],
        }
    }
}

impl FromStr for InferenceOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InferenceOp::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| format!("unknown inference operation: {}", s))
    }
}

impl std::fmt::Display for InferenceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Validate the body and pin down its `stream` flag. Returns the body to
/// forward, whether the reply will stream, and the model named.
fn prepare_body(op: InferenceOp, body: Value) -> Result<(Value, bool, String), ProxyError> {
    let Value::Object(mut map) = body else {
        return Err(ProxyError::InvalidRequest(
            "request body must be a JSON object".to_string(),
        ));
    };

    let model = op
        .model_fields()
        .iter()
        .find_map(|field| map.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ProxyError::InvalidRequest(format!(
                "{} requires a non-empty \"{}\" field",
                op,
                op.model_fields().join("\" or \"")
            ))
        })?;

    let streaming = if op.streaming_capable() {
        let stream = match map.get("stream") {
            None | Some(Value::Null) => op.default_stream(),
            Some(Value::Bool(flag)) => *flag,
            Some(_) => {
                return Err(ProxyError::InvalidRequest(
                    "\"stream\" must be a boolean".to_string(),
                ));
            }
        };
        map.insert("stream".to_string(), Value::Bool(stream));
        stream
    } else {
        false
    };

    Ok((Value::Object(map), streaming, model))
}

pub enum ProxyResponse {
    /// Complete backend body
    Buffered {
        status: StatusCode,
        content_type: Option<HeaderValue>,
        body: Bytes,
    },
    /// Backend body relayed chunk by chunk
    Streaming {
        status: StatusCode,
        stream: BoxStream<'static, Result<Bytes, std::io::Error>>,
    },
    Deleted { model: String },
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        match self {
            ProxyResponse::Buffered {
                status,
                content_type,
                body,
            } => {
                let content_type = content_type
                    .unwrap_or_else(|| HeaderValue::from_static("application/json"));
                (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
            }
            ProxyResponse::Streaming { status, stream } => (
                status,
                [(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON))],
                Body::from_stream(stream),
            )
                .into_response(),
            ProxyResponse::Deleted { model } => Json(serde_json::json!({
                "success": true,
                "message": format!("Model '{}' deleted", model),
            }))
            .into_response(),
        }
    }
}

pub struct InferenceProxy {
    backend: Arc<OllamaClient>,
    prober: Arc<dyn Prober>,
    target: TargetConfig,
    timeouts: Timeouts,
    metrics: Arc<ServerMetrics>,
}

impl InferenceProxy {
    pub fn new(
        backend: Arc<OllamaClient>,
        prober: Arc<dyn Prober>,
        target: TargetConfig,
        timeouts: Timeouts,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            backend,
            prober,
            target,
            timeouts,
            metrics,
        }
    }

    /// Forward one inference operation.
    pub async fn forward(&self, op: InferenceOp, body: Value) -> Result<ProxyResponse, ProxyError> {
        let result = self.forward_inner(op, body).await;
        if let Err(e) = &result {
            warn!("Proxy {} failed: {}", op, e);
            self.metrics.proxy_error(e);
        }
        result
    }

    /// Reachability-gated model listing.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ProxyError> {
        let result = async {
            self.ensure_reachable().await?;
            self.backend.list_models().await
        }
        .await;
        if let Err(e) = &result {
            warn!("Listing models failed: {}", e);
            self.metrics.proxy_error(e);
        }
        result
    }

    async fn forward_inner(
        &self,
        op: InferenceOp,
        body: Value,
    ) -> Result<ProxyResponse, ProxyError> {
        let (body, streaming, model) = prepare_body(op, body)?;
        self.ensure_reachable().await?;

        self.metrics.request_proxied();
        info!("Proxying {} for model {} (stream={})", op, model, streaming);

        let resp = self
            .backend
            .http()
            .request(op.method(), self.backend.url(op.backend_path()))
            .timeout(op.timeout(&self.timeouts))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::from_reqwest(e, op.name()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProxyError::Upstream {
                status: Some(status),
                detail: format!(
                    "backend answered {} to {}: {}",
                    status,
                    op,
                    backend_error_detail(&text)
                ),
            });
        }

        if op == InferenceOp::Delete {
            return Ok(ProxyResponse::Deleted { model });
        }

        if streaming {
            let stream = resp.bytes_stream().map(move |chunk| {
                chunk.map_err(|e| {
                    warn!("Stream for {} interrupted: {}", op, e);
                    std::io::Error::other(e)
                })
            });
            return Ok(ProxyResponse::Streaming {
                status,
                stream: stream.boxed(),
            });
        }

        let content_type = resp.headers().get(header::CONTENT_TYPE).cloned();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ProxyError::from_reqwest(e, op.name()))?;
        debug!("{} returned {} bytes", op, body.len());

        Ok(ProxyResponse::Buffered {
            status,
            content_type,
            body,
        })
    }

    async fn ensure_reachable(&self) -> Result<(), ProxyError> {
        let probe = self
            .prober
            .probe(&self.target.host, self.target.probe_port, self.timeouts.probe)
            .await;
        if probe.reachable {
            Ok(())
        } else {
            Err(ProxyError::ServiceUnavailable {
                target: probe.target,
            })
        }
    }
}

/// The backend reports failures as `{"error": "..."}`; fall back to the raw text.
fn backend_error_detail(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| text.trim().to_string())
}
