use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::error::{ProxyError, error_response};
use crate::proxy::InferenceOp;

/// Forward `/ollama/{op}` to the inference backend
pub async fn ollama_handler(
    State(state): State<AppState>,
    Path(op): Path<String>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let op: InferenceOp = match op.parse() {
        Ok(op) => op,
        Err(message) => return error_response(StatusCode::NOT_FOUND, "not_found", message),
    };

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            let err = ProxyError::InvalidRequest(rejection.body_text());
            state.metrics.proxy_error(&err);
            return err.into_response();
        }
    };

    match state.proxy.forward(op, body).await {
        Ok(resp) => resp.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Models installed on the backend (only when the machine is up)
pub async fn list_models_handler(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ProxyError> {
    let models = state.proxy.list_models().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("{} models available", models.len()),
        "models": models,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestRig;
    use axum::{
        Router,
        body::Body,
        http::{Request, header},
        routing::{get, post},
    };
    use tower::ServiceExt;

    async fn spawn_backend(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn app(rig: &TestRig, backend: &str) -> Router {
        Router::new()
            .route("/ollama/{op}", post(ollama_handler))
            .route("/lista_modelos", get(list_models_handler))
            .with_state(rig.app_state(backend))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_operation_is_404() {
        let rig = TestRig::new();
        let resp = app(&rig, "http://127.0.0.1:1")
            .oneshot(post_json("/ollama/embed", serde_json::json!({"model": "m"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(rig.prober.probes(), 0);
    }

    #[tokio::test]
    async fn test_generate_while_down_is_503() {
        let rig = TestRig::new();
        rig.prober.set_reachable(false);
        let resp = app(&rig, "http://127.0.0.1:1")
            .oneshot(post_json(
                "/ollama/generate",
                serde_json::json!({"model": "llama3", "prompt": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_missing_model_is_400() {
        let rig = TestRig::new();
        rig.prober.set_reachable(true);
        let resp = app(&rig, "http://127.0.0.1:1")
            .oneshot(post_json("/ollama/chat", serde_json::json!({"messages": []})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let rig = TestRig::new();
        rig.prober.set_reachable(true);
        let resp = app(&rig, "http://127.0.0.1:1")
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ollama/generate")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = json_body(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["kind"], "invalid_request");
        assert!(json["message"].is_string());
        assert_eq!(rig.prober.probes(), 0);
        assert_eq!(rig.metrics.snapshot().proxy.errors.invalid_request, 1);
    }

    #[tokio::test]
    async fn test_missing_content_type_is_invalid_request() {
        let rig = TestRig::new();
        let resp = app(&rig, "http://127.0.0.1:1")
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ollama/chat")
                    .body(Body::from(r#"{"model":"llama3"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = json_body(resp).await;
        assert_eq!(json["kind"], "invalid_request");
        assert!(
            json["message"]
                .as_str()
                .unwrap()
                .contains("Content-Type")
        );
    }

    #[tokio::test]
    async fn test_show_is_forwarded() {
        let backend = spawn_backend(Router::new().route(
            "/api/show",
            post(|| async { Json(serde_json::json!({"modelfile": "FROM llama3"})) }),
        ))
        .await;
        let rig = TestRig::new();
        rig.prober.set_reachable(true);

        let resp = app(&rig, &backend)
            .oneshot(post_json("/ollama/show", serde_json::json!({"name": "llama3"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["modelfile"], "FROM llama3");
    }

    #[tokio::test]
    async fn test_list_models() {
        let backend = spawn_backend(Router::new().route(
            "/api/tags",
            get(|| async {
                Json(serde_json::json!({"models": [{"name": "llama3", "size": 10}]}))
            }),
        ))
        .await;
        let rig = TestRig::new();
        rig.prober.set_reachable(true);

        let resp = app(&rig, &backend)
            .oneshot(
                Request::builder()
                    .uri("/lista_modelos")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "1 models available");
        assert_eq!(json["models"][0]["name"], "llama3");
    }
}
