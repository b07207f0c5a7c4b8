//! HTTP server

use crate::pool::{ExecutorPool, PoolError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use sandprof_core::ValidationError;
use sandprof_core::protocol::{ProfileRequest, ProfileResponse, StatusReport};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

type Reply = (StatusCode, Json<ProfileResponse>);

/// Build the router over a shared pool
pub fn router(pool: Arc<ExecutorPool>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/profile", post(profile))
        .route("/status", get(status))
        .route("/health", get(|| async { Json(serde_json::json!({ "status": "ok" })) }))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(pool)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn run(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn profile(
    State(pool): State<Arc<ExecutorPool>>,
    payload: Result<Json<ProfileRequest>, JsonRejection>,
) -> Reply {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "malformed request body");
            let status = match rejection.status() {
                StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            return reply(status, ProfileResponse::error(rejection.body_text()));
        }
    };

    match pool.execute(request.code).await {
        Ok(result) => reply(StatusCode::OK, result.into()),
        Err(PoolError::Validation(ValidationError::Checker(detail))) => {
            tracing::error!(%detail, "syntax check could not run");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                ProfileResponse::error(ProfileResponse::INTERNAL_ERROR),
            )
        }
        Err(PoolError::Validation(ValidationError::Indentation { .. })) => reply(
            StatusCode::BAD_REQUEST,
            ProfileResponse::error(ProfileResponse::INVALID_INDENTATION),
        ),
        Err(PoolError::Validation(e)) => {
            reply(StatusCode::BAD_REQUEST, ProfileResponse::error(e.to_string()))
        }
        Err(e @ PoolError::Saturated(_)) => {
            reply(StatusCode::SERVICE_UNAVAILABLE, ProfileResponse::error(e.to_string()))
        }
        Err(PoolError::Task(_)) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            ProfileResponse::error(ProfileResponse::INTERNAL_ERROR),
        ),
    }
}

async fn status(State(pool): State<Arc<ExecutorPool>>) -> Json<StatusReport> {
    Json(pool.status())
}

fn reply(status: StatusCode, body: ProfileResponse) -> Reply {
    (status, Json(body))
}
