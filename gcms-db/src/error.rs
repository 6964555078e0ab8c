//! Error taxonomy for the data layer
//!
//! Every failure leaving this crate is a [`DbError`]. Driver errors are first
//! reduced to a [`DriverFault`] (code + message + detail) at the driver
//! boundary, then sorted into the transient or fatal bucket by [`classify`].
//! The classifier is narrow: anything it does not recognise as a
//! connection-level failure is fatal and will not be retried.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for data layer operations
pub type Result<T> = std::result::Result<T, DbError>;

/// What kind of connection failure a transient error represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// Peer reset or aborted the connection
    ConnectionReset,
    /// Host name did not resolve or the host could not be reached
    HostUnreachable,
    /// Connection was terminated mid-flight (server shutdown, EOF)
    ConnectionTerminated,
}

/// Main error type for database operations
#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// Connection-level failure, likely to succeed on retry
    #[error("connection error: {message}")]
    Transient {
        kind: TransientKind,
        code: Option<String>,
        message: String,
    },

    /// Data or logic failure (constraint, syntax, permission); never retried
    #[error("query error: {message}")]
    Fatal {
        code: Option<String>,
        message: String,
        detail: Option<String>,
    },

    /// No connection became available within the acquisition timeout
    #[error("timed out after {}ms waiting for a database connection", waited.as_millis())]
    AcquisitionTimeout { waited: Duration },

    /// The pool was closed
    #[error("connection pool is closed")]
    PoolClosed,

    /// A schema object could not be created
    #[error("failed to provision {object}: {message}")]
    Provisioning {
        object: String,
        message: String,
        detail: Option<String>,
    },
}

impl DbError {
    /// Create a fatal error without code or detail
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            code: None,
            message: message.into(),
            detail: None,
        }
    }

    /// Create a transient error of the given kind
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Whether the executor may retry after this error
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Driver or SQLSTATE code, when one was reported
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transient { code, .. } | Self::Fatal { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Server-supplied detail string, when one was reported
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Fatal { detail, .. } | Self::Provisioning { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }

    /// The bare message without the category prefix used by `Display`
    pub fn message(&self) -> String {
        match self {
            Self::Transient { message, .. }
            | Self::Fatal { message, .. }
            | Self::Provisioning { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// A driver failure before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverFault {
    /// Errno-style code (`ECONNRESET`) or SQLSTATE (`23505`)
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
}

impl DriverFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Codes that mark a connection-level failure.
const TRANSIENT_CODES: &[(&str, TransientKind)] = &[
    ("ECONNRESET", TransientKind::ConnectionReset),
    ("ECONNABORTED", TransientKind::ConnectionReset),
    ("EPIPE", TransientKind::ConnectionReset),
    ("ENOTFOUND", TransientKind::HostUnreachable),
    // SQLSTATE class 08: connection exception
    ("08000", TransientKind::ConnectionTerminated),
    ("08003", TransientKind::ConnectionTerminated),
    ("08006", TransientKind::ConnectionTerminated),
    // admin_shutdown: server is terminating the session
    ("57P01", TransientKind::ConnectionTerminated),
];

const TERMINATED_MARKER: &str = "connection terminated";

/// Sort a driver fault into the transient or fatal bucket.
pub fn classify(fault: DriverFault) -> DbError {
    let kind = fault
        .code
        .as_deref()
        .and_then(|code| {
            TRANSIENT_CODES
                .iter()
                .find(|(known, _)| *known == code)
                .map(|(_, kind)| *kind)
        })
        .or_else(|| {
            fault
                .message
                .to_lowercase()
                .contains(TERMINATED_MARKER)
                .then_some(TransientKind::ConnectionTerminated)
        });

    match kind {
        Some(kind) => DbError::Transient {
            kind,
            code: fault.code,
            message: fault.message,
        },
        None => DbError::Fatal {
            code: fault.code,
            message: fault.message,
            detail: fault.detail,
        },
    }
}

/// Map an I/O error to an errno-style code.
fn io_code(err: &io::Error) -> Option<&'static str> {
    match err.kind() {
        io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
        io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        io::ErrorKind::BrokenPipe => Some("EPIPE"),
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        // getaddrinfo failures surface as uncategorised errors
        _ if err.to_string().contains("failed to lookup address") => Some("ENOTFOUND"),
        _ => None,
    }
}

fn io_fault(err: &io::Error) -> DriverFault {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return DriverFault::new(format!("connection terminated unexpectedly: {err}"));
    }
    let fault = DriverFault::new(err.to_string());
    match io_code(err) {
        Some(code) => fault.with_code(code),
        None => fault,
    }
}

impl From<&sqlx::Error> for DriverFault {
    fn from(err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => io_fault(io_err),
            sqlx::Error::Database(db_err) => {
                let mut fault = DriverFault::new(db_err.message());
                fault.code = db_err.code().map(|c| c.into_owned());
                fault.detail = db_err
                    .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                    .and_then(|pg| pg.detail())
                    .map(str::to_owned);
                fault
            }
            other => DriverFault::new(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        classify(DriverFault::from(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_code_is_transient() {
        let err = classify(DriverFault::new("read ECONNRESET").with_code("ECONNRESET"));
        assert!(err.is_transient());
        assert!(matches!(
            err,
            DbError::Transient {
                kind: TransientKind::ConnectionReset,
                ..
            }
        ));
    }

    #[test]
    fn dns_failure_is_host_unreachable() {
        let err = classify(DriverFault::new("getaddrinfo failed").with_code("ENOTFOUND"));
        assert!(matches!(
            err,
            DbError::Transient {
                kind: TransientKind::HostUnreachable,
                ..
            }
        ));
    }

    #[test]
    fn terminated_marker_matches_without_code() {
        let err = classify(DriverFault::new("Connection terminated due to connection timeout"));
        assert!(matches!(
            err,
            DbError::Transient {
                kind: TransientKind::ConnectionTerminated,
                ..
            }
        ));
    }

    #[test]
    fn unique_violation_is_fatal_with_detail() {
        let err = classify(
            DriverFault::new("duplicate key value violates unique constraint")
                .with_code("23505")
                .with_detail("Key (user_name)=(admin) already exists."),
        );
        assert!(!err.is_transient());
        assert_eq!(err.code(), Some("23505"));
        assert_eq!(err.detail(), Some("Key (user_name)=(admin) already exists."));
    }

    #[test]
    fn unknown_faults_default_to_fatal() {
        assert!(!classify(DriverFault::new("something odd")).is_transient());
        assert!(!classify(DriverFault::new("refused").with_code("ECONNREFUSED")).is_transient());
        assert!(!classify(DriverFault::new("permission denied").with_code("42501")).is_transient());
    }

    #[test]
    fn io_errors_map_to_codes() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(io_fault(&reset).code.as_deref(), Some("ECONNRESET"));

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "early eof");
        let err = classify(io_fault(&eof));
        assert!(err.is_transient());

        let dns = io::Error::new(io::ErrorKind::Other, "failed to lookup address information");
        assert_eq!(io_fault(&dns).code.as_deref(), Some("ENOTFOUND"));
    }

    #[test]
    fn sqlx_io_error_converts() {
        let err: DbError = sqlx::Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).into();
        assert!(err.is_transient());

        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_transient());
    }

    #[test]
    fn timeout_display() {
        let err = DbError::AcquisitionTimeout {
            waited: Duration::from_millis(2000),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 2000ms waiting for a database connection"
        );
        assert!(!err.is_transient());
    }
}
