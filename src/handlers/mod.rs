pub mod admin;
pub mod events;
pub mod transactions;
pub mod transfers;
pub mod users;

use crate::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub db: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_pool: Option<DbPoolStats>,
}

#[derive(Debug, Serialize)]
pub struct DbPoolStats {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub max_connections: u32,
    pub usage_percent: f32,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let connected = match state.ledger.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed: database unreachable");
            false
        }
    };

    let db_pool = state.pool.as_ref().map(|pool| {
        let active_connections = pool.size();
        let max_connections = pool.options().get_max_connections();
        DbPoolStats {
            active_connections,
            idle_connections: pool.num_idle() as u32,
            max_connections,
            usage_percent: (active_connections as f32 / max_connections.max(1) as f32) * 100.0,
        }
    });

    let db = match (connected, state.pool.is_some()) {
        (true, true) => "connected",
        (true, false) => "in-memory",
        (false, _) => "disconnected",
    };

    let status = HealthStatus {
        status: if connected { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        db: db.to_string(),
        db_pool,
    };

    // 503 if database is down, 200 otherwise
    let code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}
