//! API-key authentication
//!
//! Every route except the public info route requires an `X-API-Key` header
//! whose value exactly matches one of the configured keys. With no keys
//! configured all protected routes are refused.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use crate::error::error_response;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing {API_KEY_HEADER} header")]
    MissingKey,
    #[error("invalid API key")]
    InvalidKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        error_response(StatusCode::UNAUTHORIZED, "unauthorized", self.to_string())
    }
}

// =============================================================================
// Auth State (shared with the middleware)
// =============================================================================

#[derive(Clone)]
pub struct AuthState {
    pub api_keys: Arc<BTreeSet<String>>,
}

impl AuthState {
    pub fn new(api_keys: BTreeSet<String>) -> Self {
        Self {
            api_keys: Arc::new(api_keys),
        }
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingKey)?;
        if self.api_keys.contains(presented) {
            Ok(())
        } else {
            Err(AuthError::InvalidKey)
        }
    }
}

// =============================================================================
// Auth Middleware
// =============================================================================

pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_public_route(request.uri().path()) {
        return next.run(request).await;
    }

    match auth_state.verify(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
            e.into_response()
        }
    }
}

fn is_public_route(path: &str) -> bool {
    path == "/"
}
