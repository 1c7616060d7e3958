//! HTTP server implementation using Axum.

use crate::execution::{ExecutionRequest, ExecutionResult};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Response header naming the terminal state of the run.
pub const OUTCOME_HEADER: &str = "x-execution-outcome";

/// Body returned with every non-200 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    /// Allow cross-origin requests from any origin.
    pub cors: bool,
}

/// Build the router. Exposed so tests can drive it without a socket.
pub fn router(state: AppState, options: ServerOptions) -> Router {
    let app = Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if options.cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Run the HTTP server on `addr` until Ctrl-C.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    options: ServerOptions,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    serve(listener, state, options, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: AppState,
    options: ServerOptions,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, options);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn health() -> &'static str {
    "OK"
}

async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!("POST /execute - rejected: {}", rejection.body_text());
            return error_response(rejection.status(), rejection.body_text());
        }
    };

    info!("POST /execute - code_len={}", req.code.len());
    let deadline = state.request_deadline();
    let cancel = CancellationToken::new();
    match tokio::time::timeout(deadline, state.runner.execute(&req.code, &cancel)).await {
        Ok(execution) => {
            info!(
                "POST /execute - outcome={} success={}",
                execution.outcome, execution.result.success
            );
            (
                [(OUTCOME_HEADER, execution.outcome.as_str())],
                Json::<ExecutionResult>(execution.result),
            )
                .into_response()
        }
        Err(_) => {
            warn!("POST /execute - no result within {:?}", deadline);
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                format!("execution did not finish within {:?}", deadline),
            )
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
