//! gcms-server: HTTP shell for the gcms backend
//!
//! Wires configuration to the `gcms-db` pool and exposes health,
//! diagnostics, schema provisioning and login over axum.

pub mod config;
pub mod database;
pub mod http;

pub use config::{AppConfig, ConfigError, DatabaseConfig, Environment, ServerConfig};
pub use database::build_pool;
pub use http::{build_router, run_server, ApiError, AppState, ServerError};
