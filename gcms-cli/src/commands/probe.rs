//! Connectivity probe command

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use gcms_db::probe::StartupProber;
use gcms_db::{ProbeConfig, ProbeOutcome};

use super::{connect, DatabaseArgs};

#[derive(Parser, Debug)]
pub struct ProbeArgs {
    /// Handshake attempts before giving up
    #[arg(long, default_value_t = 5)]
    pub attempts: u32,

    /// Delay after the first failure; doubles after each further failure
    #[arg(long, default_value_t = 1000)]
    pub base_delay_ms: u64,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    let executor = connect(&args.db)?;
    let config = ProbeConfig {
        attempts: args.attempts,
        base_delay: Duration::from_millis(args.base_delay_ms),
        ..ProbeConfig::default()
    };

    let outcome = StartupProber::new(executor.pool().clone(), config).run().await;
    executor.pool().close().await;

    match outcome {
        ProbeOutcome::Connected {
            attempts,
            server_time,
        } => {
            println!(
                "connected after {attempts} attempt(s); server time {}",
                server_time.as_deref().unwrap_or("unknown")
            );
            Ok(())
        }
        ProbeOutcome::Exhausted {
            attempts,
            last_error,
        } => bail!("database unreachable after {attempts} attempts: {last_error}"),
    }
}
