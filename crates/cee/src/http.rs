use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandbox::{Classification, ExecutionResult, PoolStats};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::ServiceError;
use crate::executor::{ExecutionRequest, Executor};

const BANNER: &str = "CEE Running";

#[derive(Clone)]
struct AppState {
    executor: Arc<Executor>,
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    language: String,
    code: String,
    #[serde(default)]
    stdin: String,
    /// Seconds. Missing or zero selects the language default.
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    stdout: String,
    stderr: String,
    exit_code: i64,
    status: Classification,
    timed_out: bool,
    truncated: bool,
    duration_ms: u64,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            exit_code: result.exit_code,
            status: result.classification,
            timed_out: result.timed_out(),
            truncated: result.truncated,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

struct ApiError(ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_capacity() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the HTTP router. An empty `cors_origins` allows any origin.
pub fn router(executor: Arc<Executor>, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Result<Vec<HeaderValue>, _> =
            cors_origins.iter().map(|s| s.parse()).collect();
        match origins {
            Ok(origins) => CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(e) => {
                warn!(error = %e, "invalid cors origin, allowing any");
                CorsLayer::permissive()
            }
        }
    };

    Router::new()
        .route("/", get(|| async { BANNER }))
        .route("/execute", post(execute_handler))
        .route("/pool", get(pool_handler))
        .with_state(AppState { executor })
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn execute_handler(
    State(state): State<AppState>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    if body.language.trim().is_empty() {
        return Err(ApiError(ServiceError::BadRequest(
            "language must not be empty".into(),
        )));
    }
    let request = ExecutionRequest {
        language: body.language,
        code: body.code,
        stdin: body.stdin,
        timeout: body
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
    };
    let result = state.executor.execute(request).await.map_err(ApiError)?;
    Ok(Json(result.into()))
}

async fn pool_handler(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.executor.pool().stats())
}
