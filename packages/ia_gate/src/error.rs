//! Failure kinds surfaced to clients.
//!
//! Every error renders as `{ "success": false, "kind": ..., "message": ... }`
//! with an HTTP status reflecting the kind. Probe failures never appear
//! here: they are folded into `reachable = false` before anyone sees them.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use power_control::ControlError;

use crate::state_store::StoreError;

pub fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "kind": kind,
            "message": message.into(),
        })),
    )
        .into_response()
}

// =============================================================================
// Lifecycle errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The wake packet could not be sent
    #[error("wake packet not sent: {0}")]
    Transmission(#[source] ControlError),

    /// The remote command session could not be opened
    #[error("power-off failed: {0}")]
    Connection(#[source] ControlError),

    /// Session opened but both shutdown attempts failed
    #[error("power-off command failed: {0}")]
    CommandFailure(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Transmission(_) => "transmission_error",
            LifecycleError::Connection(ControlError::Authentication { .. }) => {
                "authentication_error"
            }
            LifecycleError::Connection(_) => "connection_error",
            LifecycleError::CommandFailure(_) => "command_failure",
            LifecycleError::Store(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            LifecycleError::Transmission(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LifecycleError::Connection(_) => StatusCode::BAD_GATEWAY,
            LifecycleError::CommandFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LifecycleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.kind(), self.to_string())
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        LifecycleError::Store(self).into_response()
    }
}

// =============================================================================
// Proxy errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Target host failed the reachability probe; the backend was not contacted
    #[error("inference machine is off or not answering at {target}")]
    ServiceUnavailable { target: String },

    /// Backend connection failed or exceeded the operation timeout
    #[error("{0}")]
    GatewayTimeout(String),

    /// Backend answered with a failure or broke the transport
    #[error("{detail}")]
    Upstream {
        status: Option<StatusCode>,
        detail: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Classify a client error: connect/timeout failures are gateway
    /// timeouts, everything else is an upstream failure.
    pub fn from_reqwest(err: reqwest::Error, operation: &str) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProxyError::GatewayTimeout(format!(
                "{} did not complete: backend connection failed or timed out ({})",
                operation, err
            ))
        } else {
            ProxyError::Upstream {
                status: err.status(),
                detail: format!("{} failed: {}", operation, err),
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::ServiceUnavailable { .. } => "service_unavailable",
            ProxyError::GatewayTimeout(_) => "gateway_timeout",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream {
                status: Some(status),
                ..
            } if status.is_client_error() || status.is_server_error() => *status,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.kind(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn proxy_errors_render_structured_body() {
        let resp = ProxyError::ServiceUnavailable {
            target: "10.0.0.5:22".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "service_unavailable");
        assert!(json["message"].as_str().unwrap().contains("10.0.0.5:22"));
    }

    #[test]
    fn proxy_status_mapping() {
        assert_eq!(
            ProxyError::GatewayTimeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::Upstream {
                status: None,
                detail: "reset".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        // Backend's own failure status passes through
        assert_eq!(
            ProxyError::Upstream {
                status: Some(StatusCode::NOT_FOUND),
                detail: "model not found".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::InvalidRequest("missing model".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn connect_failure_is_gateway_timeout() {
        // Port 1 is reserved and nothing listens on it
        let err = reqwest::get("http://127.0.0.1:1/api/tags")
            .await
            .unwrap_err();
        let proxy_err = ProxyError::from_reqwest(err, "list models");
        assert!(matches!(proxy_err, ProxyError::GatewayTimeout(_)));
    }

    #[tokio::test]
    async fn lifecycle_errors_render_structured_body() {
        let resp = LifecycleError::CommandFailure("both attempts failed".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["kind"], "command_failure");
        assert!(json["message"].as_str().unwrap().contains("both attempts failed"));
    }

    #[test]
    fn authentication_failure_kind() {
        let err = LifecycleError::Connection(ControlError::Authentication {
            host: "box".into(),
            user: "ops".into(),
        });
        assert_eq!(err.kind(), "authentication_error");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
