//! Health check endpoint

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::http::server::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Startup probe state; reading it never touches the database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<&'static str>,
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        database: state.probe_state().map(|s| s.as_str()),
    })
}

/// Health routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[cfg(test)]
mod tests {
    use gcms_db::testing::FakeConnector;
    use gcms_db::{Pool, PoolConfig, ProbeState};
    use tokio::sync::watch;

    use super::*;
    use crate::config::Environment;

    #[tokio::test]
    async fn health_returns_ok_without_database() {
        let connector = FakeConnector::new();
        let pool = Pool::new(PoolConfig::default(), Arc::new(connector.clone()));
        let (_tx, rx) = watch::channel(ProbeState::Attempting(2));
        let state = Arc::new(AppState::new(pool, Environment::Development).with_probe(rx));

        let Json(body) = health(State(state)).await;

        assert_eq!(body.status, "ok");
        assert_eq!(body.database, Some("probing"));
        assert_eq!(connector.state().queries(), 0);
    }
}
