//! Axum server setup
//!
//! Server skeleton with:
//! - CORS allow-list from configuration
//! - Tracing middleware and a panic guard
//! - Development-only error disclosure
//! - Graceful shutdown on SIGTERM/Ctrl+C, then pool close

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::{middleware, Router};
use gcms_db::{spawn_startup_probe, Pool, ProbeConfig, ProbeState, QueryExecutor, SchemaProvisioner};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::error::{disclose_errors, handle_panic, not_found};
use super::routes;
use crate::config::{AppConfig, Environment, ServerConfig};

/// How often idle connections are reaped and health-checked
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Shared application state
pub struct AppState {
    pub executor: QueryExecutor,
    pub provisioner: SchemaProvisioner,
    pub environment: Environment,
    /// Startup probe progress, when a probe was started
    pub probe: Option<watch::Receiver<ProbeState>>,
}

impl AppState {
    pub fn new(pool: Pool, environment: Environment) -> Self {
        let executor = QueryExecutor::new(pool);
        Self {
            provisioner: SchemaProvisioner::new(executor.clone()),
            executor,
            environment,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: watch::Receiver<ProbeState>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn probe_state(&self) -> Option<ProbeState> {
        self.probe.as_ref().map(|rx| *rx.borrow())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        tracing::info!("CORS: no origins configured, cross-origin requests are refused");
    }

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Build the application router with all routes
pub fn build_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let environment = state.environment;

    Router::new()
        .merge(routes::health::router())
        .nest("/api", routes::api_router())
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(environment, disclose_errors))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server.
///
/// Starts pool maintenance and the startup probe in the background, then
/// serves until a shutdown signal arrives. The probe never blocks startup.
///
/// # Example
///
/// ```ignore
/// let pool = build_pool(&config.database)?;
/// run_server(pool, config).await?;
/// ```
pub async fn run_server(pool: Pool, config: AppConfig) -> Result<(), ServerError> {
    let AppConfig {
        environment,
        server,
        database,
    } = config;
    let profile = if database.profile.is_managed() {
        "managed"
    } else {
        "local"
    };

    let maintenance = pool.spawn_maintenance(MAINTENANCE_INTERVAL);
    let probe = spawn_startup_probe(pool.clone(), ProbeConfig::default().with_profile(profile));

    let state = Arc::new(AppState::new(pool.clone(), environment).with_probe(probe.state()));
    let app = build_router(state, &server);

    let listener = TcpListener::bind(server.bind_addr).await?;
    tracing::info!(
        addr = %server.bind_addr,
        environment = environment.as_str(),
        "server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    probe.abort();
    maintenance.abort();
    pool.close().await;
    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, starting shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, starting shutdown");
        }
    }
}

/// Server error type
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
