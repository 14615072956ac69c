//! Route handlers.

use super::types::HealthResponse;
use crate::pipeline::{Orchestrator, PipelineEvent};
use crate::types::QueryRequest;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared handler state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

/// `POST /v1/query`: JSON by default, Server-Sent Events when the body
/// sets `"stream": true`. Policy denials and no-agent outcomes are
/// successful HTTP exchanges (200 with `success=false`).
pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let request: QueryRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            let payload = serde_json::json!({
                "success": false,
                "error": {"kind": "security", "message": format!("malformed request: {}", e)}
            });
            return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
        }
    };

    let cancel = CancellationToken::new();
    if request.stream {
        let stream = event_stream(state.orchestrator.clone(), request, cancel);
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    } else {
        let response = state.orchestrator.process_query(request, cancel, None).await;
        Json(response).into_response()
    }
}

/// Bridge the pipeline's event channel onto an SSE stream. Dropping the
/// stream (client disconnect) cancels the in-flight request.
fn event_stream(
    orchestrator: Arc<Orchestrator>,
    request: QueryRequest,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, mut rx) = mpsc::channel::<PipelineEvent>(32);
    let pipeline_cancel = cancel.clone();
    tokio::spawn(async move {
        orchestrator
            .process_query(request, pipeline_cancel, Some(tx))
            .await;
    });

    async_stream::stream! {
        // Cancels the pipeline when the client goes away and the stream is
        // dropped mid-flight.
        let _guard = cancel.drop_guard();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            match Event::default().event(event.name()).json_data(event.payload()) {
                Ok(sse_event) => yield Ok(sse_event),
                Err(e) => tracing::error!(error = %e, "failed to encode SSE event"),
            }
            if terminal {
                break;
            }
        }
    }
}

/// `GET /health`: per-agent up/degraded/down, overall status, provider
/// availability. Unauthenticated so load-balancer probes work.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let agents = state.orchestrator.registry().all_health();
    Json(HealthResponse::build(
        state.started_at.elapsed().as_secs(),
        state.orchestrator.reasoning_provider().map(String::from),
        agents,
    ))
}

/// `GET /stats`: counters, latencies, reasoning-method breakdown,
/// evaluator stats.
pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    let orchestrator = &state.orchestrator;
    let snapshot = orchestrator.stats().snapshot(
        orchestrator.registry().all_health(),
        orchestrator.audit().written_count(),
        orchestrator.audit().dropped_count(),
    );
    Json(snapshot).into_response()
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let orchestrator = &state.orchestrator;
    let agents = orchestrator.registry().all_health();
    let body = orchestrator
        .stats()
        .render_prometheus(&agents, orchestrator.audit().dropped_count());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
