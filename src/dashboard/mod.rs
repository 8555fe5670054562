use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::{FleetError, QueueError};
use crate::events::BroadcastHub;
use crate::orchestrator::Orchestrator;
use crate::scheduler::QueueStats;

#[derive(Clone)]
pub struct DashboardState {
    pub orchestrator: Orchestrator,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    observers: usize,
    jobs: QueueStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    id: String,
    request_id: String,
    host_id: String,
    command: String,
    state: String,
    attempt: u32,
    max_attempts: u32,
    exit_code: Option<i32>,
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    #[serde(default)]
    command: String,
    #[serde(default, alias = "vmIds")]
    host_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    message: &'static str,
    job_count: usize,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: FleetError) -> Response {
    let status = match &err {
        FleetError::Validation(_) => StatusCode::BAD_REQUEST,
        FleetError::Queue(QueueError::JobNotFound(_)) => StatusCode::NOT_FOUND,
        FleetError::Queue(QueueError::InvalidState { .. }) => StatusCode::CONFLICT,
        FleetError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Routes for the HTTP API, the observer WebSocket and the status page.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", delete(cancel_job_handler))
        .route("/api/execution", post(execute_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_dashboard(
    addr: SocketAddr,
    state: DashboardState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting dashboard server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        observers: state.orchestrator.hub().observer_count(),
        jobs: state.orchestrator.stats(),
    })
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .orchestrator
        .jobs()
        .into_iter()
        .map(|job| JobResponse {
            id: job.id.to_string(),
            request_id: job.request_id.to_string(),
            host_id: job.host_id,
            command: job.command,
            state: job.state.to_string(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            exit_code: job.exit_code,
            error: job.last_error,
        })
        .collect();

    Json(jobs)
}

async fn execute_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<ExecuteRequest>,
) -> Response {
    match state
        .orchestrator
        .execute(payload.command, payload.host_ids)
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(ExecuteResponse {
                message: "Execution started",
                job_count: receipt.job_count,
                request_id: receipt.request_id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Response {
    let job_id = match Uuid::parse_str(&id) {
        Ok(job_id) => job_id,
        Err(_) => return error_response(FleetError::Validation(format!("Invalid job id: {}", id))),
    };

    match state.orchestrator.cancel(&job_id) {
        Ok(job) => (StatusCode::OK, Json(serde_json::json!({ "id": job.id, "state": job.state }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<DashboardState>) -> Response {
    let hub = state.orchestrator.hub().clone();
    ws.on_upgrade(move |socket| observe(socket, hub))
}

/// Forward hub events to one WebSocket client until either side goes away.
/// This task is the connection's only writer, so events keep their order.
async fn observe(socket: WebSocket, hub: BroadcastHub) {
    let mut subscription = hub.subscribe();
    let observer_id = subscription.id();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(observer_id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Observers only listen
                Some(Ok(_)) => {}
            }
        }
    }

    let _ = sink.close().await;
    tracing::debug!(observer_id, "WebSocket observer closed");
}
