//! HTTP surface for the document pipeline.
//!
//! A compact Axum router over the tool dispatcher:
//!
//! - `POST /tools/{name}` – Run a tool with a JSON object body (may be empty) and return its
//!   result envelope. The HTTP status mirrors the envelope's error category.
//! - `GET /tools` – Tool catalog with parameter declarations, for discovery by hosts.
//! - `GET /metrics` – Pipeline counters.
//!
//! The MCP server forwards to the same dispatcher, so behavior is identical across interfaces.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::ErrorCategory;
use crate::tools::{Dispatcher, ResultEnvelope, ToolError, ToolSpec};

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    metrics: Arc<PipelineMetrics>,
}

/// Build the HTTP router over `dispatcher`.
pub fn create_router(dispatcher: Dispatcher, metrics: Arc<PipelineMetrics>) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/:name", post(call_tool))
        .route("/metrics", get(get_metrics))
        .with_state(AppState {
            dispatcher,
            metrics,
        })
}

/// Run one tool and answer with its envelope.
async fn call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let arguments = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => value,
            Err(error) => {
                let envelope = ResultEnvelope::failed(
                    ToolError::validation(
                        format!("request body is not valid JSON: {error}"),
                        "send the tool arguments as a JSON object",
                    ),
                    Duration::ZERO,
                    0,
                );
                return (StatusCode::BAD_REQUEST, Json(envelope)).into_response();
            }
        }
    };
    let envelope = state.dispatcher.execute(&name, arguments).await;
    tracing::info!(tool = %name, status = ?envelope.status, attempts = envelope.attempts, "Tool request completed");
    (status_for(&envelope), Json(envelope)).into_response()
}

fn status_for(envelope: &ResultEnvelope) -> StatusCode {
    match envelope.error_category {
        None => StatusCode::OK,
        Some(ErrorCategory::Validation) => StatusCode::BAD_REQUEST,
        Some(ErrorCategory::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCategory::LowConfidence | ErrorCategory::QualityGate | ErrorCategory::Obsolete) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Some(ErrorCategory::BackendUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorCategory::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorCategory::Cancelled) => StatusCode::CONFLICT,
        Some(ErrorCategory::Persistence | ErrorCategory::Internal) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Response body for `GET /tools`.
#[derive(Serialize)]
struct ToolsResponse {
    tools: Vec<ToolSpec>,
}

async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.dispatcher.specs(),
    })
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::create_router;
    use crate::metrics::PipelineMetrics;
    use crate::pipeline::ErrorCategory;
    use crate::retry::RetryPolicy;
    use crate::tools::{
        Dispatcher, ParamKind, ParamSpec, ToolError, ToolHandler, ToolOutput, ToolRegistry,
        ToolSpec,
    };
    use async_trait::async_trait;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode},
    };
    use serde_json::{Map, Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    struct EchoTool {
        spec: ToolSpec,
        calls: Arc<Mutex<Vec<Map<String, Value>>>>,
    }

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn call(&self, arguments: Map<String, Value>) -> Result<ToolOutput, ToolError> {
            self.calls.lock().await.push(arguments.clone());
            if arguments.get("fail").and_then(Value::as_bool) == Some(true) {
                return Err(ToolError::new(
                    ErrorCategory::QualityGate,
                    "no monetary figures",
                    "check the document",
                ));
            }
            Ok(ToolOutput::new(Value::Object(arguments)))
        }
    }

    fn app() -> (Router, Arc<Mutex<Vec<Map<String, Value>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let tool = EchoTool {
            spec: ToolSpec {
                name: "echo",
                description: "echo arguments",
                params: vec![
                    ParamSpec::required("file", ParamKind::String, "path"),
                    ParamSpec::optional("fail", ParamKind::Boolean, json!(false), "fail"),
                ],
                read_only: true,
            },
            calls: calls.clone(),
        };
        let dispatcher = Dispatcher::new(
            ToolRegistry::new().with(Arc::new(tool)),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        (
            create_router(dispatcher, Arc::new(PipelineMetrics::new())),
            calls,
        )
    }

    async fn post(app: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("router response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    #[tokio::test]
    async fn tool_route_forwards_to_dispatcher() {
        let (app, calls) = app();
        let (status, envelope) = post(app, "/tools/echo", r#"{"file":"a.txt","extra":1}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope["status"], "success");
        assert_eq!(envelope["data"], json!({"file": "a.txt", "fail": false}));
        assert_eq!(calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn error_categories_map_to_http_status() {
        let (app, calls) = app();
        let (status, envelope) = post(app.clone(), "/tools/echo", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope["error_category"], "validation");
        assert!(calls.lock().await.is_empty());

        let (status, envelope) = post(app.clone(), "/tools/echo", r#"{"file":"a","fail":true}"#).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(envelope["attempts"], 1);

        let (status, _) = post(app.clone(), "/tools/missing", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post(app, "/tools/echo", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn catalog_and_metrics_are_served() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(Request::get("/tools").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let catalog: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(catalog["tools"][0]["name"], "echo");
        assert_eq!(catalog["tools"][0]["params"][0]["required"], true);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let metrics: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(metrics["documents_indexed"], 0);
    }
}
