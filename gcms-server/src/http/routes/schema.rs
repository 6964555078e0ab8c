//! Schema provisioning and sample data endpoints
//!
//! Both accept GET for parity with the browser-driven setup flow.

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use gcms_db::SeedOutcome;
use serde_json::{json, Value};

use crate::http::error::ApiError;
use crate::http::server::AppState;

/// GET|POST /api/create-tables
async fn create_tables(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let report = state.provisioner.ensure_schema().await?;

    Ok(Json(json!({
        "success": true,
        "message": "All database tables created successfully!",
        "tables": report.tables,
        "indexes": report.indexes,
        "note": "Run /api/verify-db to confirm all tables exist",
    })))
}

/// GET|POST /api/seed-data
async fn seed_data(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let body = match state.provisioner.seed_sample_data().await? {
        SeedOutcome::Seeded => json!({
            "success": true,
            "message": "Sample data added successfully!",
            "note": "Check /api/verify-db to see updated counts",
        }),
        SeedOutcome::AlreadyPresent => json!({
            "success": true,
            "message": "Sample data already exists - no changes made",
        }),
    };
    Ok(Json(body))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/create-tables", get(create_tables).post(create_tables))
        .route("/seed-data", get(seed_data).post(seed_data))
}
