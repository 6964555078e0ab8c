//! API error types with IntoResponse
//!
//! Every failure becomes a `{ "success": false, "error": ... }` body. Server
//! errors are rendered generically here; the raw message travels in an
//! [`ErrorDetail`] response extension, and [`disclose_errors`] swaps it into
//! the body outside production.

use std::any::Any;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gcms_db::DbError;
use serde_json::json;

use crate::config::Environment;

const GENERIC_MESSAGE: &str = "Internal server error";

/// API error type with automatic HTTP status mapping
#[derive(Debug)]
pub enum ApiError {
    /// Malformed or incomplete request (400)
    BadRequest { message: String },

    /// Login failed (401)
    InvalidCredentials,

    /// Unknown route (404)
    NotFound,

    /// Database failure (500, or 503 when no connection is available)
    Database(DbError),

    /// Internal error (500)
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Database(DbError::AcquisitionTimeout { .. } | DbError::PoolClosed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Database(_) | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Raw failure text kept out of the default response body
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    pub message: String,
    pub detail: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let client_error = |message: &str| {
            (status, Json(json!({ "success": false, "error": message }))).into_response()
        };

        match self {
            Self::BadRequest { message } => client_error(&message),
            Self::InvalidCredentials => client_error("Invalid credentials"),
            Self::NotFound => client_error("Route not found"),
            Self::Database(err) => {
                tracing::error!(error = %err, code = ?err.code(), "database error");
                let detail = match &err {
                    DbError::Provisioning { detail, .. } => Some(
                        detail
                            .clone()
                            .unwrap_or_else(|| "No additional details".to_owned()),
                    ),
                    other => other.detail().map(str::to_owned),
                };
                server_error(
                    status,
                    ErrorDetail {
                        message: err.message(),
                        detail,
                    },
                )
            }
            Self::Internal { message } => {
                tracing::error!(%message, "internal error");
                server_error(
                    status,
                    ErrorDetail {
                        message,
                        detail: None,
                    },
                )
            }
        }
    }
}

fn server_error(status: StatusCode, detail: ErrorDetail) -> Response {
    let mut response = (
        status,
        Json(json!({ "success": false, "error": GENERIC_MESSAGE })),
    )
        .into_response();
    response.extensions_mut().insert(detail);
    response
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        Self::Database(e)
    }
}

/// Middleware: in development, replace generic 500 bodies with the raw
/// message and detail. Production responses are left untouched.
pub async fn disclose_errors(
    State(environment): State<Environment>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let Some(detail) = response.extensions_mut().remove::<ErrorDetail>() else {
        return response;
    };
    if environment.is_production() {
        return response;
    }

    let mut body = json!({ "success": false, "error": detail.message });
    if let Some(extra) = detail.detail {
        body["detail"] = extra.into();
    }
    (response.status(), Json(body)).into_response()
}

/// Panic hook for `CatchPanicLayer`: same envelope as any other 500.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = message, "request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": GENERIC_MESSAGE })),
    )
        .into_response()
}

/// Fallback for unmatched routes
pub async fn not_found() -> ApiError {
    ApiError::NotFound
}
