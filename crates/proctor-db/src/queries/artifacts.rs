//! Database query functions for the `test_artifacts` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{ArtifactProvider, TestArtifact};

/// Fields for a new test artifact row.
#[derive(Debug, Clone)]
pub struct NewTestArtifact<'a> {
    pub title: &'a str,
    pub file_path: &'a str,
    pub provider: ArtifactProvider,
    pub metadata: serde_json::Value,
}

/// Insert a test artifact row. Returns the inserted artifact with
/// server-generated defaults (id, created_at).
pub async fn insert_test_artifact(
    pool: &PgPool,
    artifact: &NewTestArtifact<'_>,
) -> Result<TestArtifact> {
    let row = sqlx::query_as::<_, TestArtifact>(
        "INSERT INTO test_artifacts (title, file_path, provider, metadata) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(artifact.title)
    .bind(artifact.file_path)
    .bind(artifact.provider)
    .bind(&artifact.metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert test artifact")?;

    Ok(row)
}

/// List artifacts newest first.
pub async fn list_test_artifacts(pool: &PgPool, limit: i64) -> Result<Vec<TestArtifact>> {
    let rows = sqlx::query_as::<_, TestArtifact>(
        "SELECT * FROM test_artifacts ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list test artifacts")?;

    Ok(rows)
}
