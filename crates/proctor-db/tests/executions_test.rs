//! Integration tests for the execution and report queries.

use proctor_db::models::{ExecutionStatus, ReportType};
use proctor_db::queries::{executions, reports};
use proctor_test_utils::TestDb;

#[tokio::test]
async fn upsert_is_idempotent_on_id() {
    let db = TestDb::new().await;

    let first = executions::upsert_execution(&db.pool, "exec-1", Some("api-9"), None)
        .await
        .expect("first upsert");
    assert_eq!(first.status, ExecutionStatus::Queued);
    assert_eq!(first.api_id.as_deref(), Some("api-9"));

    let second = executions::upsert_execution(&db.pool, "exec-1", None, None)
        .await
        .expect("second upsert");
    assert_eq!(second.id, first.id);
    // The original row is kept; only updated_at moves.
    assert_eq!(second.api_id.as_deref(), Some("api-9"));

    db.teardown().await;
}

#[tokio::test]
async fn first_terminal_transition_wins() {
    let db = TestDb::new().await;

    executions::upsert_execution(&db.pool, "exec-2", None, None)
        .await
        .expect("upsert");
    executions::mark_execution_running(&db.pool, "exec-2")
        .await
        .expect("running");

    let rows =
        executions::finish_execution(&db.pool, "exec-2", ExecutionStatus::Failed, Some("boom"))
            .await
            .expect("finish");
    assert_eq!(rows, 1);

    // A second terminal transition affects zero rows.
    let rows = executions::finish_execution(&db.pool, "exec-2", ExecutionStatus::Passed, None)
        .await
        .expect("finish again");
    assert_eq!(rows, 0);

    let row = executions::get_execution(&db.pool, "exec-2")
        .await
        .expect("get")
        .expect("row exists");
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.message.as_deref(), Some("boom"));

    db.teardown().await;
}

#[tokio::test]
async fn execution_reports_round_trip() {
    let db = TestDb::new().await;

    executions::upsert_execution(&db.pool, "exec-3", None, Some("tests/login.spec.ts"))
        .await
        .expect("upsert");

    reports::insert_execution_report(
        &db.pool,
        "exec-3",
        "reports/exec-3/index.html",
        ExecutionStatus::Passed,
        Some("12 passed"),
    )
    .await
    .expect("insert execution report");

    let rows = reports::list_execution_reports(&db.pool, "exec-3")
        .await
        .expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].artifact_path, "reports/exec-3/index.html");

    let report = reports::insert_test_report(
        &db.pool,
        "exec-3",
        ReportType::Json,
        "reports/exec-3.summary.json",
    )
    .await
    .expect("insert test report");
    assert_eq!(report.report_type, ReportType::Json);

    let summaries = reports::list_test_reports(&db.pool, "exec-3")
        .await
        .expect("list test reports");
    assert_eq!(summaries.len(), 1);

    db.teardown().await;
}

#[tokio::test]
async fn get_missing_execution_returns_none() {
    let db = TestDb::new().await;

    let row = executions::get_execution(&db.pool, "nope")
        .await
        .expect("get");
    assert!(row.is_none());

    db.teardown().await;
}
