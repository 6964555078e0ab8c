//! Schema provisioning, verification and seeding against the fake connector

use std::sync::Arc;

use gcms_db::schema::{INDEXES, TABLES};
use gcms_db::testing::{row, FakeConnector};
use gcms_db::{DbError, Pool, PoolConfig, QueryExecutor, SchemaProvisioner, SeedOutcome};
use serde_json::json;

fn provisioner() -> (SchemaProvisioner, FakeConnector) {
    let connector = FakeConnector::new();
    let pool = Pool::new(PoolConfig::default(), Arc::new(connector.clone()));
    (SchemaProvisioner::new(QueryExecutor::new(pool)), connector)
}

#[tokio::test]
async fn creates_tables_then_indexes_in_order() {
    let (provisioner, connector) = provisioner();
    let state = connector.state();

    let report = provisioner.ensure_schema().await.unwrap();

    assert_eq!(report.tables.len(), 11);
    assert_eq!(report.indexes.len(), 5);
    assert_eq!(report.tables[0], "organisation");
    for name in report.tables.iter().chain(report.indexes.iter()) {
        assert!(state.has_object(name), "{name} was not created");
    }

    let created: Vec<String> = state
        .statements()
        .iter()
        .filter(|s| s.starts_with("CREATE"))
        .cloned()
        .collect();
    assert_eq!(created.len(), TABLES.len() + INDEXES.len());
    assert!(created[..TABLES.len()].iter().all(|s| s.starts_with("CREATE TABLE")));
    assert!(created[TABLES.len()..].iter().all(|s| s.starts_with("CREATE INDEX")));
}

#[tokio::test]
async fn ensure_schema_is_idempotent() {
    let (provisioner, connector) = provisioner();
    let state = connector.state();

    let first = provisioner.ensure_schema().await.unwrap();
    let catalog = state.catalog();
    let second = provisioner.ensure_schema().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(state.catalog(), catalog);
}

#[tokio::test]
async fn failure_stops_at_the_failing_object() {
    let (provisioner, connector) = provisioner();
    let state = connector.state();
    state.fail_on(
        "payments",
        DbError::Fatal {
            code: Some("42501".into()),
            message: "permission denied for schema public".into(),
            detail: Some("role lacks CREATE".into()),
        },
    );

    let err = provisioner.ensure_schema().await.unwrap_err();

    match &err {
        DbError::Provisioning {
            object,
            message,
            detail,
        } => {
            assert_eq!(object, "payments");
            assert_eq!(message, "permission denied for schema public");
            assert_eq!(detail.as_deref(), Some("role lacks CREATE"));
        }
        other => panic!("expected provisioning error, got {other:?}"),
    }
    assert_eq!(err.detail(), Some("role lacks CREATE"));

    // everything before payments exists, nothing after it was attempted
    assert!(state.has_object("users_login"));
    assert!(!state.has_object("payments"));
    assert!(!state.has_object("notifications"));
    assert!(!state.has_object("idx_payments_plot"));

    // a later run completes the schema
    state.clear_fail_on("payments");
    provisioner.ensure_schema().await.unwrap();
    assert_eq!(state.catalog().len(), TABLES.len() + INDEXES.len());
}

#[tokio::test(start_paused = true)]
async fn transient_ddl_failure_is_retried() {
    let (provisioner, connector) = provisioner();
    connector.state().fail_next_queries_transient(1);

    provisioner.ensure_schema().await.unwrap();
    assert!(connector.state().has_object("organisation"));
}

#[tokio::test]
async fn verify_reports_missing_tables_without_failing() {
    let (provisioner, _connector) = provisioner();

    let report = provisioner.verify_schema().await.unwrap();

    assert_eq!(report.summary.total_tables, 11);
    assert_eq!(report.summary.existing_tables, 0);
    let first = &report.tables[0];
    assert!(!first.exists);
    assert!(first.record_count.is_none());
    assert!(first.error.as_deref().unwrap().contains("does not exist"));
}

#[tokio::test]
async fn verify_counts_records() {
    let (provisioner, connector) = provisioner();
    let state = connector.state();
    provisioner.ensure_schema().await.unwrap();
    state.on_query(
        "COUNT(*) AS count FROM residents",
        vec![row(json!({ "count": 3 }))],
    );
    state.on_query(
        "current_database()",
        vec![row(json!({
            "database": "gcms",
            "user": "gcms_app",
            "version": "PostgreSQL 16.2"
        }))],
    );

    let report = provisioner.verify_schema().await.unwrap();

    assert_eq!(report.summary.existing_tables, 11);
    assert_eq!(report.summary.total_records, 3);
    assert_eq!(report.database.as_deref(), Some("gcms"));
    assert_eq!(report.user.as_deref(), Some("gcms_app"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["summary"]["totalTables"], json!(11));
    assert_eq!(json["tables"][0]["recordCount"], json!(0));
    assert!(json["tables"][0].get("error").is_none());
}

#[tokio::test]
async fn seeds_only_an_empty_schema() {
    let (provisioner, connector) = provisioner();
    let state = connector.state();
    provisioner.ensure_schema().await.unwrap();

    assert_eq!(provisioner.seed_sample_data().await.unwrap(), SeedOutcome::Seeded);
    assert_eq!(state.count_statements("INSERT INTO"), 6);

    state.on_query(
        "COUNT(*) AS count FROM organisation",
        vec![row(json!({ "count": 1 }))],
    );
    assert_eq!(
        provisioner.seed_sample_data().await.unwrap(),
        SeedOutcome::AlreadyPresent
    );
    assert_eq!(state.count_statements("INSERT INTO"), 6);
}

#[tokio::test]
async fn failed_seed_rolls_back_and_reruns_cleanly() {
    let (provisioner, connector) = provisioner();
    let state = connector.state();
    provisioner.ensure_schema().await.unwrap();
    state.fail_on(
        "streets",
        DbError::Fatal {
            code: Some("23503".into()),
            message: "insert or update on table \"streets\" violates foreign key constraint".into(),
            detail: None,
        },
    );

    let err = provisioner.seed_sample_data().await.unwrap_err();
    assert_eq!(err.code(), Some("23503"));
    assert_eq!(state.count_statements("BEGIN"), 1);
    assert_eq!(state.count_statements("ROLLBACK"), 1);
    assert_eq!(state.count_statements("COMMIT"), 0);
    assert_eq!(state.count_statements("INSERT INTO plots"), 0);

    state.clear_fail_on("streets");
    assert_eq!(provisioner.seed_sample_data().await.unwrap(), SeedOutcome::Seeded);

    let statements = state.statements();
    let begin = statements.iter().rposition(|s| s == "BEGIN").unwrap();
    let tail = &statements[begin + 1..];
    assert_eq!(tail.iter().filter(|s| s.starts_with("INSERT INTO")).count(), 6);
    assert_eq!(tail.last().map(String::as_str), Some("COMMIT"));
}
