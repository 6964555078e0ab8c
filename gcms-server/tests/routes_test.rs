//! Router-level tests against the in-memory connector

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use gcms_db::testing::{row, FakeConnector, FakeState};
use gcms_db::{DbError, Pool, PoolConfig};
use gcms_server::{build_router, AppState, Environment, ServerConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    db: Arc<FakeState>,
    state: Arc<AppState>,
}

fn app_with(environment: Environment, pool_config: PoolConfig) -> TestApp {
    let connector = FakeConnector::new();
    let db = connector.state();
    let pool = Pool::new(pool_config, Arc::new(connector));
    let state = Arc::new(AppState::new(pool, environment));
    TestApp {
        router: build_router(Arc::clone(&state), &ServerConfig::default()),
        db,
        state,
    }
}

fn app() -> TestApp {
    app_with(Environment::Development, PoolConfig::default())
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_does_not_touch_the_database() {
    let app = app();

    let (status, body) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body.get("database").is_none());
    assert_eq!(app.db.queries(), 0);
}

#[tokio::test]
async fn server_test_route() {
    let app = app();
    let (status, body) = send(&app.router, get("/api/test")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "message": "Server is running!" }));
}

#[tokio::test]
async fn database_test_returns_server_time() {
    let app = app();
    app.db.on_query(
        "SELECT NOW() AS current_time",
        vec![row(json!({ "current_time": "2026-10-19T09:30:00+00:00" }))],
    );

    let (status, body) = send(&app.router, get("/api/test-db")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["timestamp"], "2026-10-19T09:30:00+00:00");
}

#[tokio::test]
async fn create_tables_is_repeatable() {
    let app = app();

    let (status, body) = send(&app.router, post_json("/api/create-tables", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["tables"].as_array().unwrap().len(), 11);
    assert_eq!(body["indexes"].as_array().unwrap().len(), 5);

    let (status, _) = send(&app.router, get("/api/create-tables")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.db.catalog().len(), 16);
}

fn fail_plots(db: &FakeState) {
    db.fail_on(
        "plots",
        DbError::Fatal {
            code: Some("42501".into()),
            message: "permission denied for schema public".into(),
            detail: Some("role gcms_app lacks CREATE".into()),
        },
    );
}

#[tokio::test]
async fn create_tables_failure_discloses_detail_in_development() {
    let app = app();
    fail_plots(&app.db);

    let (status, body) = send(&app.router, get("/api/create-tables")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "permission denied for schema public");
    assert_eq!(body["detail"], "role gcms_app lacks CREATE");
}

#[tokio::test]
async fn create_tables_failure_is_generic_in_production() {
    let app = app_with(Environment::Production, PoolConfig::default());
    fail_plots(&app.db);

    let (status, body) = send(&app.router, get("/api/create-tables")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "success": false, "error": "Internal server error" }));
}

#[tokio::test]
async fn verify_after_provisioning() {
    let app = app();
    send(&app.router, get("/api/create-tables")).await;

    let (status, body) = send(&app.router, get("/api/verify-db")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["totalTables"], 11);
    assert_eq!(body["summary"]["existingTables"], 11);
    assert_eq!(body["tables"]["organisation"], json!({ "exists": true, "recordCount": 0 }));
}

#[tokio::test]
async fn verify_reports_missing_tables() {
    let app = app();

    let (status, body) = send(&app.router, get("/api/verify-db")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["existingTables"], 0);
    assert_eq!(body["tables"]["payments"]["exists"], false);
    assert!(body["tables"]["payments"]["error"].is_string());
}

#[tokio::test]
async fn seed_data_runs_once() {
    let app = app();
    send(&app.router, get("/api/create-tables")).await;

    let (status, body) = send(&app.router, post_json("/api/seed-data", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Sample data added successfully!");

    app.db.on_query(
        "COUNT(*) AS count FROM organisation",
        vec![row(json!({ "count": 1 }))],
    );
    let (_, body) = send(&app.router, get("/api/seed-data")).await;
    assert_eq!(body["message"], "Sample data already exists - no changes made");
}

#[tokio::test]
async fn login_requires_both_fields() {
    let app = app();

    let (status, body) = send(&app.router, post_json("/api/login", json!({ "username": "admin" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(app.db.queries(), 0);
}

#[tokio::test]
async fn login_rejects_malformed_json() {
    let app = app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn login_with_unknown_user_is_401() {
    let app = app();
    app.db.on_query("FROM users_login WHERE user_name", Vec::new());

    let (status, body) = send(
        &app.router,
        post_json("/api/login", json!({ "username": "admin", "password": "nope" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "success": false, "error": "Invalid credentials" }));
}

#[tokio::test]
async fn login_returns_user_and_touches_last_login() {
    let app = app();
    app.db.on_query(
        "FROM users_login WHERE user_name",
        vec![row(json!({
            "user_id": 1,
            "user_name": "admin",
            "user_type": "admin",
            "org_id": 1,
            "plot_id": null,
            "resident_id": null
        }))],
    );

    let (status, body) = send(
        &app.router,
        post_json("/api/login", json!({ "username": "admin", "password": "admin123" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["username"], "admin");
    assert_eq!(body["user"]["type"], "admin");
    assert_eq!(body["user"]["plotId"], Value::Null);
    assert_eq!(app.db.count_statements("UPDATE users_login SET last_login"), 1);
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let app = app();
    let (status, body) = send(&app.router, get("/api/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "success": false, "error": "Route not found" }));
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_is_503() {
    let app = app_with(
        Environment::Production,
        PoolConfig::default()
            .with_max_connections(1)
            .with_acquire_timeout(Duration::from_millis(100)),
    );
    let _held = app.state.executor.pool().acquire().await.unwrap();

    let (status, body) = send(&app.router, get("/api/test-db")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Internal server error");
}

#[tokio::test]
async fn cors_preflight_allows_dev_origin() {
    let app = app();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/login")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "http://localhost:3000"
    );
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
        "true"
    );
}
