use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::error::LifecycleError;

/// Stored lifecycle record, without probing
pub async fn status_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.status().await?))
}

/// Re-probe host and service, clearing leases and permanent mode
pub async fn init_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.refresh_status(true).await?))
}

/// Re-probe host and service
pub async fn test_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.refresh_status(false).await?))
}

pub async fn wake_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.wake().await?))
}

pub async fn conditional_shutdown_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.conditional_shutdown().await?))
}

pub async fn forced_shutdown_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.forced_shutdown().await?))
}

pub async fn permanent_on_enable_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.set_permanent(true).await?))
}

pub async fn permanent_on_disable_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, LifecycleError> {
    Ok(Json(state.coordinator.set_permanent(false).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{PowerMode, TestRig};
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        routing::{get, post},
    };
    use tower::ServiceExt;

    fn app(rig: &TestRig) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/init", post(init_handler))
            .route("/test", get(test_handler))
            .route("/arrancar", post(wake_handler))
            .route("/apagar", post(conditional_shutdown_handler))
            .route("/shutdown", post(forced_shutdown_handler))
            .route("/permanent_on_enable", post(permanent_on_enable_handler))
            .route("/permanent_on_disable", post(permanent_on_disable_handler))
            .with_state(rig.app_state("http://127.0.0.1:1"))
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_returns_record() {
        let rig = TestRig::new();
        let app = app(&rig);

        let (status, json) = call(&app, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["request_counter"], 0);
        assert_eq!(json["permanent_on"], false);
        assert!(json["updated_at"].is_string());
        // Pure snapshot: nothing was probed
        assert_eq!(rig.prober.probes(), 0);
    }

    #[tokio::test]
    async fn test_wake_then_apagar() {
        let rig = TestRig::new();
        rig.prober.set_reachable(true);
        let app = app(&rig);

        let (status, json) = call(&app, "POST", "/arrancar").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["leases"], 1);
        assert_eq!(json["packet_sent"], false);

        let (status, json) = call(&app, "POST", "/apagar").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["powered_off"], true);
        assert_eq!(json["method"], "privileged");
    }

    #[tokio::test]
    async fn test_wake_transmission_failure_is_500() {
        let rig = TestRig::new();
        rig.waker.set_failing(true);
        let app = app(&rig);

        let (status, json) = call(&app, "POST", "/arrancar").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "transmission_error");
    }

    #[tokio::test]
    async fn test_shutdown_connection_failure_is_502() {
        let rig = TestRig::new();
        rig.prober.set_reachable(true);
        rig.power.set_mode(PowerMode::Unreachable);
        let app = app(&rig);

        let (status, json) = call(&app, "POST", "/shutdown").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["kind"], "connection_error");
    }

    #[tokio::test]
    async fn test_permanent_toggle() {
        let rig = TestRig::new();
        let app = app(&rig);

        let (_, json) = call(&app, "POST", "/permanent_on_enable").await;
        assert_eq!(json["permanent_on"], true);
        let (_, json) = call(&app, "GET", "/status").await;
        assert_eq!(json["permanent_on"], true);

        let (_, json) = call(&app, "POST", "/permanent_on_disable").await;
        assert_eq!(json["permanent_on"], false);
    }

    #[tokio::test]
    async fn test_init_resets_leases() {
        let rig = TestRig::new();
        rig.prober.set_reachable(true);
        rig.service.set_alive(true);
        rig.set_state(|s| {
            s.request_counter = 4;
            s.permanent_on = true;
        })
        .await;
        let app = app(&rig);

        let (_, json) = call(&app, "GET", "/test").await;
        assert_eq!(json["host_online"], true);
        assert_eq!(json["service_online"], true);
        assert_eq!(json["state"]["request_counter"], 4);

        let (status, json) = call(&app, "POST", "/init").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"]["request_counter"], 0);
        assert_eq!(json["state"]["permanent_on"], false);
    }
}
