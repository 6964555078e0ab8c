//! Login endpoint

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::post, Json, Router};
use gcms_db::{Row, SqlValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::error::ApiError;
use crate::http::extractors::JsonBody;
use crate::http::server::AppState;

const FIND_USER_SQL: &str = "SELECT user_id, user_name, user_type, org_id, plot_id, resident_id \
     FROM users_login WHERE user_name = $1 AND password = $2";

const TOUCH_LAST_LOGIN_SQL: &str =
    "UPDATE users_login SET last_login = CURRENT_TIMESTAMP WHERE user_id = $1";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    pub id: Value,
    pub username: Value,
    #[serde(rename = "type")]
    pub user_type: Value,
    pub org_id: Value,
    pub plot_id: Value,
    pub resident_id: Value,
}

impl From<Row> for LoginUser {
    fn from(mut row: Row) -> Self {
        let mut take = |column: &str| row.remove(column).unwrap_or(Value::Null);
        Self {
            id: take("user_id"),
            username: take("user_name"),
            user_type: take("user_type"),
            org_id: take("org_id"),
            plot_id: take("plot_id"),
            resident_id: take("resident_id"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub user: LoginUser,
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// POST /api/login
async fn login(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let (Some(username), Some(password)) = (required(req.username), required(req.password)) else {
        return Err(ApiError::bad_request("Username and password are required"));
    };

    let found = state
        .executor
        .fetch_optional(
            FIND_USER_SQL,
            &[SqlValue::from(username.as_str()), SqlValue::from(password)],
        )
        .await?;

    let Some(row) = found else {
        tracing::info!(%username, "login rejected");
        return Err(ApiError::InvalidCredentials);
    };
    let user = LoginUser::from(row);

    if let Some(id) = user.id.as_i64() {
        state
            .executor
            .execute(TOUCH_LAST_LOGIN_SQL, &[SqlValue::Int(id)])
            .await?;
    }
    tracing::info!(%username, "login succeeded");

    Ok(Json(LoginResponse {
        success: true,
        user,
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/login", post(login))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn maps_columns_to_camel_case() {
        let row = match json!({
            "user_id": 2,
            "user_name": "ravi_k",
            "user_type": "owner",
            "org_id": 1,
            "plot_id": 1,
            "resident_id": 1
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let rendered = serde_json::to_value(LoginUser::from(row)).unwrap();
        assert_eq!(
            rendered,
            json!({
                "id": 2,
                "username": "ravi_k",
                "type": "owner",
                "orgId": 1,
                "plotId": 1,
                "residentId": 1
            })
        );
    }

    #[test]
    fn blank_fields_are_missing() {
        assert_eq!(required(Some("  ".into())), None);
        assert_eq!(required(Some("admin".into())), Some("admin".into()));
    }
}
