use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use concierge_agent::AgentRuntime;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    runtime: Arc<AgentRuntime>,
    transport_mode: &'static str,
}

impl HealthState {
    pub fn new(runtime: Arc<AgentRuntime>, transport_mode: &'static str) -> Self {
        Self { runtime, transport_mode }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssistantSnapshot {
    pub active_rooms: usize,
    pub active_conversations: usize,
    pub registered_tools: usize,
    pub workflow_handlers: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub assistant: HealthCheck,
    pub snapshot: AssistantSnapshot,
    pub transport_mode: &'static str,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    state: HealthState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        let server = axum::serve(listener, router(state)).with_graceful_shutdown(cancel.cancelled_owned());
        if let Err(error) = server.await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = AssistantSnapshot {
        active_rooms: state.runtime.contexts().len(),
        active_conversations: state.runtime.sessions().len(),
        registered_tools: state.runtime.tools().len(),
        workflow_handlers: state.runtime.router().handler_count(),
    };
    let assistant = assistant_check(&snapshot);
    let ready = assistant.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "concierge-server runtime initialized".to_string(),
        },
        assistant,
        snapshot,
        transport_mode: state.transport_mode,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn assistant_check(snapshot: &AssistantSnapshot) -> HealthCheck {
    if snapshot.workflow_handlers == 0 {
        return HealthCheck { status: "degraded", detail: "no workflow handler registered".to_string() };
    }
    if snapshot.registered_tools == 0 {
        return HealthCheck { status: "degraded", detail: "tool catalog is empty".to_string() };
    }
    HealthCheck {
        status: "ready",
        detail: format!(
            "{} handlers, {} tools",
            snapshot.workflow_handlers, snapshot.registered_tools
        ),
    }
}
