//! Health check handlers.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Run an async check with timeout; returns "healthy", "timeout", or "{prefix}: {error}".
async fn run_check<F, E>(timeout: Duration, f: F, error_prefix: &str) -> String
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match tokio::time::timeout(timeout, f).await {
        Ok(Ok(())) => "healthy".to_string(),
        Ok(Err(e)) => format!("{}: {}", error_prefix, e),
        Err(_) => "timeout".to_string(),
    }
}

#[derive(Debug, Serialize)]
pub(super) struct HealthCheckResponse {
    pub status: String,
    pub database: String,
}

/// Liveness: the process is running.
pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

/// Readiness: the database answers.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match state.pool.clone() {
        Some(pool) => {
            run_check(
                CHECK_TIMEOUT,
                async move { sqlx::query("SELECT 1").execute(&pool).await.map(drop) },
                "unhealthy",
            )
            .await
        }
        None => "in_memory".to_string(),
    };

    let healthy = database == "healthy" || database == "in_memory";
    if !healthy {
        tracing::error!(database = %database, "Health check failed");
    }
    let response = HealthCheckResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        database,
    };
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}
