//! Driver seam between the pool and a concrete database
//!
//! The pool only ever sees these two traits; [`crate::postgres`] implements
//! them over sqlx, [`crate::testing`] over in-memory fakes.

use async_trait::async_trait;

use crate::error::Result;
use crate::value::{Row, SqlValue};

/// An open, authenticated channel to the database
#[async_trait]
pub trait Connection: Send {
    /// Run one statement with positional parameters
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Cheap liveness round-trip
    async fn ping(&mut self) -> Result<()>;

    /// True once the connection has seen a connection-level fault and must
    /// not be handed out again
    fn is_broken(&self) -> bool;

    /// Close gracefully
    async fn close(self: Box<Self>);
}

/// Opens new connections for the pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}
