//! HTTP server command

use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use gcms_server::{build_pool, run_server};

use super::{load_config, DatabaseArgs};

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Port to listen on (default: 5001)
    #[arg(long, short = 'p', env = "PORT")]
    pub port: Option<u16>,

    /// Address to bind to (default: 0.0.0.0 in production, 127.0.0.1 otherwise)
    #[arg(long, env = "GCMS_HOST")]
    pub host: Option<IpAddr>,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

/// Run the HTTP server until Ctrl+C or SIGTERM
pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = load_config(&[
        ("PORT", args.port.map(|p| p.to_string())),
        ("GCMS_HOST", args.host.map(|h| h.to_string())),
        ("DATABASE_URL", args.db.database_url),
    ])?;

    tracing::info!(environment = config.environment.as_str(), "starting gcms server");

    let pool = build_pool(&config.database).context("Failed to configure database pool")?;

    run_server(pool, config)
        .await
        .context("Server error")?;

    Ok(())
}
