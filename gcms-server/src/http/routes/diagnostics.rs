//! Liveness and database diagnostics

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Value};

use crate::http::error::ApiError;
use crate::http::server::AppState;

/// GET /api/test
async fn server_test() -> Json<Value> {
    Json(json!({ "success": true, "message": "Server is running!" }))
}

/// GET /api/test-db - one round-trip through the executor
async fn database_test(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let row = state
        .executor
        .fetch_one("SELECT NOW() AS current_time", &[])
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Database connected successfully!",
        "timestamp": row.get("current_time").cloned().unwrap_or(Value::Null),
    })))
}

/// GET /api/verify-db - table existence and row counts
async fn verify_database(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let report = state.provisioner.verify_schema().await?;

    let mut tables = Map::new();
    for table in &report.tables {
        let mut status = json!({ "exists": table.exists });
        if let Some(count) = table.record_count {
            status["recordCount"] = count.into();
        }
        if let Some(error) = &table.error {
            status["error"] = error.clone().into();
        }
        tables.insert(table.name.clone(), status);
    }

    Ok(Json(json!({
        "success": true,
        "message": "Database verification complete",
        "database": report.database,
        "user": report.user,
        "version": report.version,
        "tables": tables,
        "summary": report.summary,
    })))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/test", get(server_test))
        .route("/test-db", get(database_test))
        .route("/verify-db", get(verify_database))
}
