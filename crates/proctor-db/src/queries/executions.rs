//! Database query functions for the `executions` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{Execution, ExecutionStatus};

/// Insert an execution row, or return the existing one if the id is already
/// present (re-delivered execution requests are effect-idempotent).
pub async fn upsert_execution(
    pool: &PgPool,
    id: &str,
    api_id: Option<&str>,
    test_file_path: Option<&str>,
) -> Result<Execution> {
    let execution = sqlx::query_as::<_, Execution>(
        "INSERT INTO executions (id, api_id, test_file_path) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE SET updated_at = now() \
         RETURNING *",
    )
    .bind(id)
    .bind(api_id)
    .bind(test_file_path)
    .fetch_one(pool)
    .await
    .context("failed to upsert execution")?;

    Ok(execution)
}

/// Fetch a single execution by ID.
pub async fn get_execution(pool: &PgPool, id: &str) -> Result<Option<Execution>> {
    let execution = sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch execution")?;

    Ok(execution)
}

/// Update the progress of a running execution.
pub async fn update_execution_progress(pool: &PgPool, id: &str, progress: f64) -> Result<()> {
    sqlx::query("UPDATE executions SET progress = $1, updated_at = now() WHERE id = $2")
        .bind(progress)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update execution progress")?;

    Ok(())
}

/// Mark an execution as running.
pub async fn mark_execution_running(pool: &PgPool, id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE executions SET status = 'running', updated_at = now() \
         WHERE id = $1 AND status NOT IN ('passed', 'failed', 'canceled')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark execution running")?;

    Ok(())
}

/// Atomically move an execution to a terminal status.
///
/// Uses optimistic locking: the WHERE clause excludes rows already in a
/// terminal status, so the first terminal transition wins and any later one
/// affects zero rows. Returns the number of rows affected.
pub async fn finish_execution(
    pool: &PgPool,
    id: &str,
    status: ExecutionStatus,
    message: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions \
         SET status = $1, message = $2, progress = 1.0, updated_at = now() \
         WHERE id = $3 AND status NOT IN ('passed', 'failed', 'canceled')",
    )
    .bind(status)
    .bind(message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish execution")?;

    Ok(result.rows_affected())
}

/// List the most recent executions, newest first.
pub async fn list_recent_executions(pool: &PgPool, limit: i64) -> Result<Vec<Execution>> {
    let executions = sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions ORDER BY started_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent executions")?;

    Ok(executions)
}
