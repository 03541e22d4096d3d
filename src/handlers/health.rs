use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use utoipa::ToSchema;

use crate::handlers::AppState;

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

impl ComponentStatus {
    fn from_ok(ok: bool) -> Self {
        if ok {
            Self::Up
        } else {
            Self::Down
        }
    }

    fn status_code(self) -> StatusCode {
        match self {
            Self::Up => StatusCode::OK,
            Self::Down => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub database: ComponentHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderHealthResponse {
    pub provider: String,
    pub api_version: String,
    pub status: ComponentStatus,
    pub latency_ms: u64,
}

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call this on application startup)
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

/// Liveness plus database reachability
#[utoipa::path(
    get,
    path = "/health",
    summary = "Service health",
    responses(
        (status = 200, description = "Service and database are up", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse),
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let db_result = crate::db::check_connection(&state.db).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let database = ComponentHealth {
        status: ComponentStatus::from_ok(db_result.is_ok()),
        message: db_result.map_or_else(
            |e| format!("Connection failed: {e}"),
            |_| "Connection successful".to_string(),
        ),
        latency_ms,
    };
    let status = database.status;

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: uptime_secs(),
        database,
    };

    (status.status_code(), Json(response))
}

/// Whether an Amilon access token can be obtained
#[utoipa::path(
    get,
    path = "/health/amilon",
    summary = "Amilon connectivity",
    responses(
        (status = 200, description = "Amilon credentials accepted", body = ProviderHealthResponse),
        (status = 503, description = "Amilon unreachable or credentials rejected", body = ProviderHealthResponse),
    ),
    tag = "health"
)]
pub async fn amilon_health(State(state): State<AppState>) -> impl IntoResponse {
    let orders = &state.services.amilon_orders;
    let started = Instant::now();
    let healthy = orders.is_healthy().await;

    let status = ComponentStatus::from_ok(healthy);
    let response = ProviderHealthResponse {
        provider: orders.provider_name().to_string(),
        api_version: orders.api_version().to_string(),
        status,
        latency_ms: started.elapsed().as_millis() as u64,
    };

    (status.status_code(), Json(response))
}

/// Endpoints:
/// - GET /health        - service and database
/// - GET /health/amilon - vendor credentials
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/amilon", get(amilon_health))
}
