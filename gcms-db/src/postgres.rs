//! sqlx-backed Postgres connections
//!
//! Opens single `PgConnection`s for the pool and turns `PgRow`s into JSON
//! rows. Errors are classified here, at the driver boundary.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::types::{Decimal, JsonValue, Uuid};
use sqlx::{Column, Connection as _, Postgres, Row as _, TypeInfo};

use crate::connection::{Connection, Connector};
use crate::error::{DbError, Result};
use crate::value::{Row, SqlType, SqlValue};

/// Opens Postgres connections from fixed connect options
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(Box::new(PgConn {
            inner: conn,
            broken: false,
        }))
    }
}

struct PgConn {
    inner: PgConnection,
    broken: bool,
}

impl PgConn {
    fn observe(&mut self, err: sqlx::Error) -> DbError {
        let err = DbError::from(err);
        if err.is_transient() {
            self.broken = true;
        }
        err
    }
}

#[async_trait]
impl Connection for PgConn {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let query = params.iter().fold(sqlx::query(sql), bind_param);
        match query.fetch_all(&mut self.inner).await {
            Ok(rows) => rows.iter().map(decode_row).collect(),
            Err(err) => Err(self.observe(err)),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        match self.inner.ping().await {
            Ok(()) => Ok(()),
            Err(err) => {
                // a failed ping means the session is unusable whatever the cause
                self.broken = true;
                Err(DbError::from(err))
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(self: Box<Self>) {
        if let Err(err) = self.inner.close().await {
            tracing::debug!(error = %err, "error while closing connection");
        }
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null(SqlType::Bool) => query.bind(None::<bool>),
        SqlValue::Null(SqlType::Int) => query.bind(None::<i64>),
        SqlValue::Null(SqlType::Float) => query.bind(None::<f64>),
        SqlValue::Null(SqlType::Text) => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
    }
}

fn decode_row(row: &PgRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name())?;
        out.insert(column.name().to_owned(), value);
    }
    Ok(out)
}

/// Decode one column by its Postgres type name.
///
/// NUMERIC becomes a string so no precision is lost; date/time types become
/// ISO-8601 strings. Types without a mapping decode as null.
fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<Value> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::from),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::from(f64::from(v))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::from),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx)?.map(Value::from)
        }
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<JsonValue>, _>(idx)?,
        other => {
            tracing::debug!(column = idx, type_name = other, "no JSON mapping for column type");
            None
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Pool, PoolConfig, QueryExecutor};

    // Run with: DATABASE_URL=postgres://... cargo test -p gcms-db -- --ignored

    fn connector() -> PgConnector {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        PgConnector::new(url.parse().expect("invalid DATABASE_URL"))
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn decodes_common_types() {
        let pool = Pool::new(PoolConfig::default(), Arc::new(connector()));
        let executor = QueryExecutor::new(pool);

        let row = executor
            .fetch_one(
                "SELECT 1::int4 AS i, 12.50::numeric(10,2) AS amount, 'x'::varchar AS s, \
                 NULL::text AS missing, DATE '2024-03-01' AS d, $1::int8 AS bound",
                &[SqlValue::Int(42)],
            )
            .await
            .expect("query failed");

        assert_eq!(row["i"], Value::from(1));
        assert_eq!(row["amount"], Value::from("12.50"));
        assert_eq!(row["s"], Value::from("x"));
        assert_eq!(row["missing"], Value::Null);
        assert_eq!(row["d"], Value::from("2024-03-01"));
        assert_eq!(row["bound"], Value::from(42));
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn typed_nulls_fit_integer_and_numeric_columns() {
        let pool = Pool::new(PoolConfig::default().with_max_connections(1), Arc::new(connector()));
        let mut conn = pool.acquire().await.expect("acquire failed");

        conn.query(
            "CREATE TEMP TABLE owners (plot_id INTEGER, amount NUMERIC(10,2), name TEXT)",
            &[],
        )
        .await
        .expect("create failed");
        conn.query(
            "INSERT INTO owners (plot_id, amount, name) VALUES ($1, $2, $3)",
            &[
                SqlValue::from(None::<i32>),
                SqlValue::from(None::<f64>),
                SqlValue::from(None::<String>),
            ],
        )
        .await
        .expect("insert of nulls failed");

        let rows = conn
            .query("SELECT plot_id, amount, name FROM owners", &[])
            .await
            .expect("select failed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["plot_id"], Value::Null);
        assert_eq!(rows[0]["amount"], Value::Null);
        assert_eq!(rows[0]["name"], Value::Null);
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn unique_violation_is_fatal() {
        let pool = Pool::new(PoolConfig::default().with_max_connections(1), Arc::new(connector()));
        let mut conn = pool.acquire().await.expect("acquire failed");

        conn.query("CREATE TEMP TABLE dup (k int PRIMARY KEY)", &[]).await.expect("create failed");
        conn.query("INSERT INTO dup VALUES (1)", &[]).await.expect("insert failed");
        let err = conn
            .query("INSERT INTO dup VALUES (1)", &[])
            .await
            .expect_err("duplicate insert must fail");

        assert!(!err.is_transient());
        assert_eq!(err.code(), Some("23505"));
    }
}
