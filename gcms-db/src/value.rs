//! Query parameters and result rows

use serde::Serialize;

/// A result row: column name to JSON value, in column order of the result set.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Parameter type, carried by nulls so the server sees a typed parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    Int,
    Float,
    Text,
}

/// A scalar query parameter, bound positionally (`$1`, `$2`, ...)
///
/// A null keeps the type of the value it stands in for: an untyped NULL
/// would be sent as TEXT and rejected by integer or numeric columns.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlType),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Rust types with a fixed parameter type
pub trait SqlParam: Into<SqlValue> {
    const SQL_TYPE: SqlType;
}

impl SqlParam for bool {
    const SQL_TYPE: SqlType = SqlType::Bool;
}

impl SqlParam for i32 {
    const SQL_TYPE: SqlType = SqlType::Int;
}

impl SqlParam for i64 {
    const SQL_TYPE: SqlType = SqlType::Int;
}

impl SqlParam for f64 {
    const SQL_TYPE: SqlType = SqlType::Float;
}

impl SqlParam for &str {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl SqlParam for String {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl<T: SqlParam> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null(T::SQL_TYPE), Into::into)
    }
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }
}

/// Rows returned by a successful [`execute`](crate::QueryExecutor::execute)
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Attempts it took; 1 means no retry happened
    pub attempts: u32,
}

impl QueryResult {
    /// First row, if any
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
