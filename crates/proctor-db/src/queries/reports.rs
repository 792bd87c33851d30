//! Database query functions for the `execution_reports` and `test_reports`
//! tables.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{ExecutionReport, ExecutionStatus, ReportType, TestReport};

/// Insert an execution report row (written by the executor after each run).
pub async fn insert_execution_report(
    pool: &PgPool,
    execution_id: &str,
    artifact_path: &str,
    status: ExecutionStatus,
    summary: Option<&str>,
) -> Result<ExecutionReport> {
    let row = sqlx::query_as::<_, ExecutionReport>(
        "INSERT INTO execution_reports (execution_id, artifact_path, status, summary) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(artifact_path)
    .bind(status)
    .bind(summary)
    .fetch_one(pool)
    .await
    .context("failed to insert execution report")?;

    Ok(row)
}

/// List all execution reports for a given execution, oldest first.
pub async fn list_execution_reports(
    pool: &PgPool,
    execution_id: &str,
) -> Result<Vec<ExecutionReport>> {
    let rows = sqlx::query_as::<_, ExecutionReport>(
        "SELECT * FROM execution_reports WHERE execution_id = $1 ORDER BY created_at ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to list execution reports")?;

    Ok(rows)
}

/// Insert a test report row (written by the reporter).
pub async fn insert_test_report(
    pool: &PgPool,
    execution_id: &str,
    report_type: ReportType,
    file_path: &str,
) -> Result<TestReport> {
    let row = sqlx::query_as::<_, TestReport>(
        "INSERT INTO test_reports (execution_id, report_type, file_path) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(report_type)
    .bind(file_path)
    .fetch_one(pool)
    .await
    .context("failed to insert test report")?;

    Ok(row)
}

/// List all test reports for a given execution, newest first.
pub async fn list_test_reports(pool: &PgPool, execution_id: &str) -> Result<Vec<TestReport>> {
    let rows = sqlx::query_as::<_, TestReport>(
        "SELECT * FROM test_reports WHERE execution_id = $1 ORDER BY created_at DESC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to list test reports")?;

    Ok(rows)
}
