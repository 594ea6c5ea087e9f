// SPDX-License-Identifier: GPL-2.0-only
use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use keel_lib::agent::RouteTable;
use keel_lib::store::traits::{DbStatus, StateStore};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseInfo>,
    pub roles: Vec<String>,
}

#[derive(Serialize)]
pub struct DatabaseInfo {
    pub path: String,
    pub table_count: usize,
    pub size_bytes: Option<u64>,
}

impl From<DbStatus> for DatabaseInfo {
    fn from(s: DbStatus) -> Self {
        DatabaseInfo {
            path: s.path,
            table_count: s.table_count,
            size_bytes: s.size_bytes,
        }
    }
}

/// Application state shared across handlers.
pub struct AppState {
    pub store: Arc<dyn StateStore + Send + Sync>,
    pub roles: Vec<String>,
    /// Set when this process runs the agent role.
    pub routes: Option<watch::Receiver<Arc<RouteTable>>>,
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    match state.store.status() {
        Ok(db_status) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                database: Some(DatabaseInfo::from(db_status)),
                roles: state.roles.clone(),
            }),
        ),
        Err(e) => {
            warn!(error = %e, "health check: database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".to_string(),
                    database: None,
                    roles: state.roles.clone(),
                }),
            )
        }
    }
}

/// The agent's published table when this process has one, otherwise the
/// cluster-wide view straight from the store.
async fn routes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RouteTable>, (StatusCode, Json<serde_json::Value>)> {
    if let Some(rx) = &state.routes {
        let table = rx.borrow().clone();
        return Ok(Json(RouteTable::clone(&table)));
    }
    match state.store.list_routes(None) {
        Ok(rows) => Ok(Json(RouteTable::from_routes(rows))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/routes", get(routes))
        .with_state(state)
}
