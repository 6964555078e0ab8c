//! Command implementations for the gcms CLI

pub mod probe;
pub mod schema;
pub mod serve;
pub mod verify;

use anyhow::{Context, Result};
use clap::Args;
use gcms_db::QueryExecutor;
use gcms_server::{build_pool, AppConfig};

// Re-export main dispatcher functions for flat access from main.rs
pub use probe::run_probe;
pub use schema::run_schema;
pub use serve::run_serve;
pub use verify::run_verify;

/// Database selection shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct DatabaseArgs {
    /// Database URL (overrides the environment; selects the managed profile)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
}

/// Load configuration from the environment with flag values layered on top.
pub fn load_config(overrides: &[(&str, Option<String>)]) -> Result<AppConfig> {
    AppConfig::from_lookup(|key| {
        overrides
            .iter()
            .find(|(name, _)| *name == key)
            .and_then(|(_, value)| value.clone())
            .or_else(|| std::env::var(key).ok())
    })
    .context("Invalid configuration")
}

/// Executor over a fresh pool for one-shot commands
pub fn connect(db: &DatabaseArgs) -> Result<QueryExecutor> {
    let config = load_config(&[("DATABASE_URL", db.database_url.clone())])?;
    let pool = build_pool(&config.database).context("Failed to configure database pool")?;
    Ok(QueryExecutor::new(pool))
}
