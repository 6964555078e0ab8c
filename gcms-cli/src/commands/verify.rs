//! Schema verification command

use anyhow::{Context, Result};
use clap::Parser;
use gcms_db::SchemaProvisioner;

use super::{connect, DatabaseArgs};

#[derive(Parser, Debug)]
pub struct VerifyArgs {
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

pub async fn run_verify(args: VerifyArgs) -> Result<()> {
    let executor = connect(&args.db)?;
    let report = SchemaProvisioner::new(executor.clone()).verify_schema().await;
    executor.pool().close().await;
    let report = report.context("Schema verification failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "database: {}  user: {}",
        report.database.as_deref().unwrap_or("-"),
        report.user.as_deref().unwrap_or("-")
    );
    for table in &report.tables {
        match (table.exists, table.record_count) {
            (true, Some(count)) => println!("  {:<22} {count:>8} rows", table.name),
            _ => println!(
                "  {:<22} missing ({})",
                table.name,
                table.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!(
        "{}/{} tables present, {} records",
        report.summary.existing_tables, report.summary.total_tables, report.summary.total_records
    );
    Ok(())
}
