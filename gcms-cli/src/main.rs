//! gcms CLI - entry point for the gated-community backend
//!
//! Subcommands:
//! - `serve`: run the HTTP API
//! - `schema ensure|seed`: provision tables and sample data
//! - `verify`: report which tables exist and how many rows they hold
//! - `probe`: check database connectivity with backoff
//!
//! A `.env` file in the working directory is loaded first.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "gcms",
    author,
    version,
    about = "Gated-community management backend",
    long_about = "Serves the gated-community API over a pooled, retrying Postgres layer, \
                  and provisions or checks the database schema."
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API server
    Serve(commands::serve::ServeArgs),
    /// Create tables/indexes or insert sample data
    Schema(commands::schema::SchemaArgs),
    /// Verify that every table exists and count its rows
    Verify(commands::verify::VerifyArgs),
    /// Probe database connectivity with exponential backoff
    Probe(commands::probe::ProbeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_setup::init(&tracing_setup::TracingConfig { debug: cli.debug }).ok();

    match cli.command {
        Commands::Serve(args) => commands::run_serve(args).await?,
        Commands::Schema(args) => commands::run_schema(args).await?,
        Commands::Verify(args) => commands::run_verify(args).await?,
        Commands::Probe(args) => commands::run_probe(args).await?,
    }
    Ok(())
}
