//! Pool construction from [`DatabaseConfig`]

use std::sync::Arc;

use gcms_db::{PgConnector, Pool};
use sqlx::postgres::PgConnectOptions;

use crate::config::{ConfigError, DatabaseConfig, DatabaseProfile};

/// Resolve connect options for the configured profile.
pub fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions, ConfigError> {
    let options = match &config.profile {
        DatabaseProfile::Managed { url } => url.parse::<PgConnectOptions>().map_err(|e| {
            // sqlx echoes the input on some parse errors; keep the URL out of it
            ConfigError::Invalid {
                var: "DATABASE_URL",
                reason: parse_error_kind(&e),
            }
        })?,
        DatabaseProfile::Local {
            host,
            port,
            user,
            password,
            database,
        } => {
            let options = PgConnectOptions::new()
                .host(host)
                .port(*port)
                .username(user)
                .database(database);
            match password {
                Some(password) => options.password(password),
                None => options,
            }
        }
    };

    Ok(match config.ssl_mode {
        Some(mode) => options.ssl_mode(mode),
        None => options,
    })
}

fn parse_error_kind(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Configuration(_) => "not a valid postgres connection URL".into(),
        _ => "could not be parsed".into(),
    }
}

/// Build the pool. No connection is opened until first use.
pub fn build_pool(config: &DatabaseConfig) -> Result<Pool, ConfigError> {
    let options = connect_options(config)?;
    match &config.profile {
        DatabaseProfile::Managed { .. } => tracing::info!(
            host = options.get_host(),
            database = options.get_database().unwrap_or("-"),
            ssl_mode = ?config.ssl_mode,
            "using managed database"
        ),
        DatabaseProfile::Local { host, database, .. } => tracing::info!(
            host = %host,
            database = %database,
            "using local database"
        ),
    }
    tracing::debug!(pool = ?config.pool, "pool settings");

    Ok(Pool::new(
        config.pool.clone(),
        Arc::new(PgConnector::new(options)),
    ))
}
