//! Database query functions for the `log_entries` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{LogEntryRow, LogLevel};

/// Fields for a new log entry row.
#[derive(Debug, Clone)]
pub struct NewLogEntry<'a> {
    pub level: LogLevel,
    pub message: &'a str,
    pub context: serde_json::Value,
    pub source_type: &'a str,
    pub source_instance: &'a str,
    pub source_node: &'a str,
    pub tags: &'a [String],
    pub correlation_id: Option<&'a str>,
}

/// Insert a log entry row.
pub async fn insert_log_entry(pool: &PgPool, entry: &NewLogEntry<'_>) -> Result<LogEntryRow> {
    let row = sqlx::query_as::<_, LogEntryRow>(
        "INSERT INTO log_entries \
         (level, message, context, source_type, source_instance, source_node, tags, correlation_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(entry.level)
    .bind(entry.message)
    .bind(&entry.context)
    .bind(entry.source_type)
    .bind(entry.source_instance)
    .bind(entry.source_node)
    .bind(entry.tags)
    .bind(entry.correlation_id)
    .fetch_one(pool)
    .await
    .context("failed to insert log entry")?;

    Ok(row)
}

/// Query log entries, optionally filtering by level and message substring.
///
/// Results are newest first and capped at `limit` rows.
pub async fn query_log_entries(
    pool: &PgPool,
    level: Option<LogLevel>,
    message_like: Option<&str>,
    limit: i64,
) -> Result<Vec<LogEntryRow>> {
    let pattern = message_like.map(|q| format!("%{q}%"));

    let rows = sqlx::query_as::<_, LogEntryRow>(
        "SELECT * FROM log_entries \
         WHERE ($1::text IS NULL OR level = $1) \
           AND ($2::text IS NULL OR message ILIKE $2) \
         ORDER BY ts DESC \
         LIMIT $3",
    )
    .bind(level)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to query log entries")?;

    Ok(rows)
}
