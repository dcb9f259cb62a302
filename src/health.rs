//! Health check HTTP endpoint for process supervisors and scrapers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::server::{MetricsSnapshot, ServerState};

/// Health check state
pub struct HealthState {
    pub server: Arc<ServerState>,
    pub start_time: Instant,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
    pub uptime_secs: u64,
    pub registered_servers: usize,
    pub pending_clients: usize,
    pub metrics: MetricsSnapshot,
}

async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let server = &state.server;
    let response = HealthResponse {
        status: "healthy",
        name: server.config.name.clone(),
        version: server.config.version.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        registered_servers: server.registry.server_count(),
        pending_clients: server.registry.client_count(),
        metrics: server.metrics.snapshot(),
    };

    (StatusCode::OK, Json(response))
}

/// Prometheus-compatible metrics endpoint
async fn prometheus_metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let metrics = state.server.metrics.snapshot();
    let registered_servers = state.server.registry.server_count();
    let pending_clients = state.server.registry.client_count();

    let output = format!(
        r#"# HELP gatepunch_active_connections Current number of TCP connections
# TYPE gatepunch_active_connections gauge
gatepunch_active_connections {active_connections}

# HELP gatepunch_total_connections Total TCP connections since start
# TYPE gatepunch_total_connections counter
gatepunch_total_connections {total_connections}

# HELP gatepunch_punches Total punch handshakes dispatched
# TYPE gatepunch_punches counter
gatepunch_punches {punches}

# HELP gatepunch_failed_connects Total connect requests answered with a failure
# TYPE gatepunch_failed_connects counter
gatepunch_failed_connects {failed_connects}

# HELP gatepunch_lobby_requests Total lobby listings sent
# TYPE gatepunch_lobby_requests counter
gatepunch_lobby_requests {lobby_requests}

# HELP gatepunch_udp_datagrams Total UDP datagrams received
# TYPE gatepunch_udp_datagrams counter
gatepunch_udp_datagrams {udp_datagrams}

# HELP gatepunch_udp_errors Total UDP datagrams that could not be parsed
# TYPE gatepunch_udp_errors counter
gatepunch_udp_errors {udp_errors}

# HELP gatepunch_errors Total connections ended by an error
# TYPE gatepunch_errors counter
gatepunch_errors {errors}

# HELP gatepunch_registered_servers Current number of server records
# TYPE gatepunch_registered_servers gauge
gatepunch_registered_servers {registered_servers}

# HELP gatepunch_pending_clients Current number of client records
# TYPE gatepunch_pending_clients gauge
gatepunch_pending_clients {pending_clients}

# HELP gatepunch_uptime_seconds Server uptime in seconds
# TYPE gatepunch_uptime_seconds gauge
gatepunch_uptime_seconds {uptime}
"#,
        active_connections = metrics.active_connections,
        total_connections = metrics.total_connections,
        punches = metrics.punches,
        failed_connects = metrics.failed_connects,
        lobby_requests = metrics.lobby_requests,
        udp_datagrams = metrics.udp_datagrams,
        udp_errors = metrics.udp_errors,
        errors = metrics.errors,
        registered_servers = registered_servers,
        pending_clients = pending_clients,
        uptime = state.start_time.elapsed().as_secs(),
    );

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        output,
    )
}

/// Create the health check router
pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/livez", get(liveness))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the health check endpoint on an already bound listener
pub async fn run_health_server(state: Arc<HealthState>, listener: TcpListener) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Health check server listening");

    axum::serve(listener, health_router(state)).await?;

    Ok(())
}
