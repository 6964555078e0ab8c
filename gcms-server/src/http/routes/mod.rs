//! Route handlers

use std::sync::Arc;

use axum::Router;

use super::server::AppState;

pub mod auth;
pub mod diagnostics;
pub mod health;
pub mod schema;

/// Everything mounted under `/api`
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(diagnostics::router())
        .merge(schema::router())
        .merge(auth::router())
}
