//! gcms-db: pooled Postgres access for the gcms backend
//!
//! Layers, leaf first:
//! - [`pool`]: bounded connection pool with acquisition timeout, use-count
//!   recycling and idle eviction
//! - [`executor`]: the retrying query path every handler goes through
//! - [`probe`]: background startup connectivity check
//! - [`schema`]: idempotent table/index provisioning
//!
//! The pool talks to the database through the [`Connector`]/[`Connection`]
//! traits; [`postgres`] provides the sqlx-backed implementation.

pub mod connection;
pub mod error;
pub mod executor;
pub mod pool;
pub mod postgres;
pub mod probe;
pub mod schema;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{Connection, Connector};
pub use error::{classify, DbError, DriverFault, Result, TransientKind};
pub use executor::{QueryExecutor, RetryPolicy};
pub use pool::{Pool, PoolConfig, PoolEvent, PoolStats, PoolStatus, PooledConnection, RemoveReason};
pub use postgres::PgConnector;
pub use probe::{spawn_startup_probe, ProbeConfig, ProbeHandle, ProbeOutcome, ProbeState};
pub use schema::{SchemaProvisioner, SchemaReport, SeedOutcome, VerifyReport};
pub use value::{QueryResult, Row, SqlParam, SqlType, SqlValue};
