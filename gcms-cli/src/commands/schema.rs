//! Schema provisioning commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gcms_db::{SchemaProvisioner, SeedOutcome};

use super::{connect, DatabaseArgs};

#[derive(Parser, Debug)]
pub struct SchemaArgs {
    #[command(subcommand)]
    pub command: SchemaCommands,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

#[derive(Subcommand, Debug)]
pub enum SchemaCommands {
    /// Create any missing tables and indexes (safe to re-run)
    Ensure,
    /// Insert the sample community if the organisation table is empty
    Seed,
}

pub async fn run_schema(args: SchemaArgs) -> Result<()> {
    let executor = connect(&args.db)?;
    let provisioner = SchemaProvisioner::new(executor.clone());

    let result = match args.command {
        SchemaCommands::Ensure => ensure(&provisioner).await,
        SchemaCommands::Seed => seed(&provisioner).await,
    };
    executor.pool().close().await;
    result
}

async fn ensure(provisioner: &SchemaProvisioner) -> Result<()> {
    let report = provisioner
        .ensure_schema()
        .await
        .context("Schema provisioning failed")?;

    println!("Tables ({}):", report.tables.len());
    for table in &report.tables {
        println!("  {table}");
    }
    println!("Indexes ({}):", report.indexes.len());
    for index in &report.indexes {
        println!("  {index}");
    }
    Ok(())
}

async fn seed(provisioner: &SchemaProvisioner) -> Result<()> {
    match provisioner
        .seed_sample_data()
        .await
        .context("Seeding sample data failed")?
    {
        SeedOutcome::Seeded => println!("Sample data added"),
        SeedOutcome::AlreadyPresent => println!("Sample data already exists - no changes made"),
    }
    Ok(())
}
