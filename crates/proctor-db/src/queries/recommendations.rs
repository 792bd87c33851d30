//! Database query functions for the `recommendations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{Recommendation, RecommendationSeverity};

/// Insert a recommendation row.
pub async fn insert_recommendation(
    pool: &PgPool,
    execution_id: &str,
    kind: &str,
    severity: RecommendationSeverity,
    details: Option<&str>,
) -> Result<Recommendation> {
    let row = sqlx::query_as::<_, Recommendation>(
        "INSERT INTO recommendations (execution_id, kind, severity, details) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(execution_id)
    .bind(kind)
    .bind(severity)
    .bind(details)
    .fetch_one(pool)
    .await
    .context("failed to insert recommendation")?;

    Ok(row)
}

/// List all recommendations for a given execution, newest first.
pub async fn list_recommendations(
    pool: &PgPool,
    execution_id: &str,
) -> Result<Vec<Recommendation>> {
    let rows = sqlx::query_as::<_, Recommendation>(
        "SELECT * FROM recommendations WHERE execution_id = $1 ORDER BY created_at DESC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to list recommendations")?;

    Ok(rows)
}
