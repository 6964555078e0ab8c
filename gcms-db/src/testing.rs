//! In-memory connector for tests
//!
//! [`FakeConnector`] hands out connections that answer from scripted
//! responses and keep a tiny catalog of objects created with
//! `CREATE ... IF NOT EXISTS`. Failures can be queued per query or per
//! connect, and [`FakeState::sever_all`] breaks every open connection the
//! way a server restart would. Like a real socket, a severed connection
//! only notices on its next query or ping.
//!
//! Enabled for this crate's own tests and, through the `testing` feature,
//! for dependents.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::connection::{Connection, Connector};
use crate::error::{DbError, Result, TransientKind};
use crate::value::{Row, SqlValue};

#[derive(Default)]
struct Script {
    connect_failures: VecDeque<DbError>,
    query_failures: VecDeque<DbError>,
    responders: Vec<(String, Vec<Row>)>,
    fail_on: HashMap<String, DbError>,
    catalog: BTreeSet<String>,
    statements: Vec<String>,
    connect_delay: Option<Duration>,
    query_delay: Option<Duration>,
}

/// Shared script and counters behind a [`FakeConnector`]
#[derive(Default)]
pub struct FakeState {
    script: Mutex<Script>,
    connects: AtomicUsize,
    queries: AtomicUsize,
    live: AtomicUsize,
    generation: AtomicU64,
}

impl FakeState {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `connect` with `err`
    pub fn fail_next_connect(&self, err: DbError) {
        self.script().connect_failures.push_back(err);
    }

    /// Fail the next query (on any connection) with `err`
    pub fn fail_next_query(&self, err: DbError) {
        self.script().query_failures.push_back(err);
    }

    /// Fail the next `n` queries with a connection reset
    pub fn fail_next_queries_transient(&self, n: usize) {
        for _ in 0..n {
            self.fail_next_query(reset_error());
        }
    }

    /// Fail DDL for, or inserts into, `object` until cleared
    pub fn fail_on(&self, object: &str, err: DbError) {
        self.script().fail_on.insert(object.to_owned(), err);
    }

    pub fn clear_fail_on(&self, object: &str) {
        self.script().fail_on.remove(object);
    }

    /// Answer queries containing `pattern` with `rows`
    pub fn on_query(&self, pattern: &str, rows: Vec<Row>) {
        self.script().responders.push((pattern.to_owned(), rows));
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.script().connect_delay = delay;
    }

    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.script().query_delay = delay;
    }

    /// Break every connection opened so far. Nothing reports broken until
    /// the connection is next used.
    pub fn sever_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Acquire)
    }

    /// Connections opened and not yet closed or dropped
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Objects created so far, in name order
    pub fn catalog(&self) -> Vec<String> {
        self.script().catalog.iter().cloned().collect()
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.script().catalog.contains(name)
    }

    /// Every statement received, trimmed
    pub fn statements(&self) -> Vec<String> {
        self.script().statements.clone()
    }

    /// How many received statements start with `prefix`
    pub fn count_statements(&self, prefix: &str) -> usize {
        self.script()
            .statements
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    fn respond(&self, sql: &str) -> Result<Vec<Row>> {
        let mut script = self.script();
        let statement = sql.trim().to_owned();
        script.statements.push(statement.clone());

        if let Some(err) = script.query_failures.pop_front() {
            return Err(err);
        }

        if let Some(object) = created_object(&statement) {
            if let Some(err) = script.fail_on.get(&object) {
                return Err(err.clone());
            }
            script.catalog.insert(object);
            return Ok(Vec::new());
        }

        if let Some(table) = inserted_table(&statement) {
            if let Some(err) = script.fail_on.get(&table) {
                return Err(err.clone());
            }
        }

        if let Some((_, rows)) = script
            .responders
            .iter()
            .rev()
            .find(|(pattern, _)| statement.contains(pattern.as_str()))
        {
            return Ok(rows.clone());
        }

        if let Some(table) = counted_table(&statement) {
            if !script.catalog.contains(&table) {
                return Err(DbError::Fatal {
                    code: Some("42P01".into()),
                    message: format!("relation \"{table}\" does not exist"),
                    detail: None,
                });
            }
            return Ok(vec![row(json!({ "count": 0 }))]);
        }

        Ok(vec![row(json!({ "?column?": 1 }))])
    }
}

/// Connector backed by a shared [`FakeState`]
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<FakeState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (failure, delay) = {
            let mut script = self.state.script();
            (script.connect_failures.pop_front(), script.connect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        self.state.connects.fetch_add(1, Ordering::AcqRel);
        self.state.live.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(FakeConnection {
            state: Arc::clone(&self.state),
            generation: self.state.generation.load(Ordering::Acquire),
            broken: false,
        }))
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
    generation: u64,
    broken: bool,
}

impl FakeConnection {
    fn severed(&self) -> bool {
        self.generation < self.state.generation.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&mut self, sql: &str, _params: &[SqlValue]) -> Result<Vec<Row>> {
        self.state.queries.fetch_add(1, Ordering::AcqRel);
        let delay = self.state.script().query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.broken || self.severed() {
            self.broken = true;
            return Err(terminated_error());
        }
        let result = self.state.respond(sql);
        if matches!(&result, Err(err) if err.is_transient()) {
            self.broken = true;
        }
        result
    }

    async fn ping(&mut self) -> Result<()> {
        if self.broken || self.severed() {
            self.broken = true;
            return Err(terminated_error());
        }
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(self: Box<Self>) {}
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection reset, as raised by a dropped socket
pub fn reset_error() -> DbError {
    DbError::Transient {
        kind: TransientKind::ConnectionReset,
        code: Some("ECONNRESET".into()),
        message: "read ECONNRESET".into(),
    }
}

pub fn terminated_error() -> DbError {
    DbError::transient(
        TransientKind::ConnectionTerminated,
        "Connection terminated unexpectedly",
    )
}

/// Build a row from a JSON object literal; panics on anything else.
pub fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("row must be a JSON object, got {other}"),
    }
}

fn created_object(sql: &str) -> Option<String> {
    let rest = sql
        .strip_prefix("CREATE TABLE IF NOT EXISTS ")
        .or_else(|| sql.strip_prefix("CREATE INDEX IF NOT EXISTS "))?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

fn inserted_table(sql: &str) -> Option<String> {
    let rest = sql.strip_prefix("INSERT INTO ")?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

fn counted_table(sql: &str) -> Option<String> {
    let (_, rest) = sql.split_once("COUNT(*) AS count FROM ")?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_created_object_names() {
        assert_eq!(
            created_object("CREATE TABLE IF NOT EXISTS plots (\n id SERIAL)").as_deref(),
            Some("plots")
        );
        assert_eq!(
            created_object("CREATE INDEX IF NOT EXISTS idx_a ON a(b)").as_deref(),
            Some("idx_a")
        );
        assert_eq!(created_object("SELECT 1"), None);
    }

    #[test]
    fn parses_inserted_table() {
        assert_eq!(
            inserted_table("INSERT INTO streets (org_id) VALUES (1)").as_deref(),
            Some("streets")
        );
        assert_eq!(inserted_table("SELECT 1"), None);
    }

    #[test]
    fn parses_counted_table() {
        assert_eq!(
            counted_table("SELECT COUNT(*) AS count FROM residents").as_deref(),
            Some("residents")
        );
    }
}
