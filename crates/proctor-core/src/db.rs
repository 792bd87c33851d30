//! The database collaborator.
//!
//! Agents persist rows through the object-safe [`Database`] trait and treat
//! them as opaque append/read. [`PgDatabase`] delegates to the sqlx query
//! layer in `proctor-db`; [`MemoryDatabase`] keeps everything in-process for
//! simulate mode and tests.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use proctor_db::models::{
    ArtifactProvider, Execution, ExecutionReport, ExecutionStatus, LogEntryRow, LogLevel,
    Recommendation, RecommendationSeverity, ReportType, TestArtifact, TestReport,
};
use proctor_db::queries;

use crate::message::AgentIdentity;

/// An owned log record handed to the database collaborator.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub source: AgentIdentity,
    pub tags: Vec<String>,
    pub correlation_id: Option<String>,
}

/// Opaque relational persistence used by the agents.
#[async_trait]
pub trait Database: Send + Sync {
    async fn upsert_execution(
        &self,
        id: &str,
        api_id: Option<&str>,
        test_file_path: Option<&str>,
    ) -> Result<()>;

    async fn mark_execution_running(&self, id: &str) -> Result<()>;

    async fn update_execution_progress(&self, id: &str, progress: f64) -> Result<()>;

    /// Move an execution to a terminal status. Returns `true` when this
    /// call performed the transition; a later call against an already
    /// terminal execution returns `false`.
    async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        message: Option<&str>,
    ) -> Result<bool>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>>;

    async fn insert_test_artifact(
        &self,
        title: &str,
        file_path: &str,
        provider: ArtifactProvider,
        metadata: serde_json::Value,
    ) -> Result<()>;

    async fn insert_execution_report(
        &self,
        execution_id: &str,
        artifact_path: &str,
        status: ExecutionStatus,
        summary: Option<&str>,
    ) -> Result<()>;

    async fn list_execution_reports(&self, execution_id: &str) -> Result<Vec<ExecutionReport>>;

    async fn insert_test_report(
        &self,
        execution_id: &str,
        report_type: ReportType,
        file_path: &str,
    ) -> Result<()>;

    async fn insert_log_entry(&self, record: &LogRecord) -> Result<()>;

    async fn query_log_entries(
        &self,
        level: Option<LogLevel>,
        message_like: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LogEntryRow>>;

    async fn insert_recommendation(
        &self,
        execution_id: &str,
        kind: &str,
        severity: RecommendationSeverity,
        details: Option<&str>,
    ) -> Result<()>;

    async fn list_recommendations(&self, execution_id: &str) -> Result<Vec<Recommendation>>;
}

// Compile-time assertion: Database must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Database) {}
};

// ---------------------------------------------------------------------------
// PostgreSQL implementation
// ---------------------------------------------------------------------------

/// [`Database`] backed by the sqlx query layer.
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn upsert_execution(
        &self,
        id: &str,
        api_id: Option<&str>,
        test_file_path: Option<&str>,
    ) -> Result<()> {
        queries::executions::upsert_execution(&self.pool, id, api_id, test_file_path).await?;
        Ok(())
    }

    async fn mark_execution_running(&self, id: &str) -> Result<()> {
        queries::executions::mark_execution_running(&self.pool, id).await
    }

    async fn update_execution_progress(&self, id: &str, progress: f64) -> Result<()> {
        queries::executions::update_execution_progress(&self.pool, id, progress).await
    }

    async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let rows = queries::executions::finish_execution(&self.pool, id, status, message).await?;
        Ok(rows > 0)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        queries::executions::get_execution(&self.pool, id).await
    }

    async fn insert_test_artifact(
        &self,
        title: &str,
        file_path: &str,
        provider: ArtifactProvider,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let new = queries::artifacts::NewTestArtifact {
            title,
            file_path,
            provider,
            metadata,
        };
        queries::artifacts::insert_test_artifact(&self.pool, &new).await?;
        Ok(())
    }

    async fn insert_execution_report(
        &self,
        execution_id: &str,
        artifact_path: &str,
        status: ExecutionStatus,
        summary: Option<&str>,
    ) -> Result<()> {
        queries::reports::insert_execution_report(
            &self.pool,
            execution_id,
            artifact_path,
            status,
            summary,
        )
        .await?;
        Ok(())
    }

    async fn list_execution_reports(&self, execution_id: &str) -> Result<Vec<ExecutionReport>> {
        queries::reports::list_execution_reports(&self.pool, execution_id).await
    }

    async fn insert_test_report(
        &self,
        execution_id: &str,
        report_type: ReportType,
        file_path: &str,
    ) -> Result<()> {
        queries::reports::insert_test_report(&self.pool, execution_id, report_type, file_path)
            .await?;
        Ok(())
    }

    async fn insert_log_entry(&self, record: &LogRecord) -> Result<()> {
        let source_type = record.source.agent_type.to_string();
        let entry = queries::logs::NewLogEntry {
            level: record.level,
            message: &record.message,
            context: record.context.clone(),
            source_type: &source_type,
            source_instance: &record.source.instance,
            source_node: &record.source.node,
            tags: &record.tags,
            correlation_id: record.correlation_id.as_deref(),
        };
        queries::logs::insert_log_entry(&self.pool, &entry).await?;
        Ok(())
    }

    async fn query_log_entries(
        &self,
        level: Option<LogLevel>,
        message_like: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LogEntryRow>> {
        queries::logs::query_log_entries(&self.pool, level, message_like, limit).await
    }

    async fn insert_recommendation(
        &self,
        execution_id: &str,
        kind: &str,
        severity: RecommendationSeverity,
        details: Option<&str>,
    ) -> Result<()> {
        queries::recommendations::insert_recommendation(
            &self.pool,
            execution_id,
            kind,
            severity,
            details,
        )
        .await?;
        Ok(())
    }

    async fn list_recommendations(&self, execution_id: &str) -> Result<Vec<Recommendation>> {
        queries::recommendations::list_recommendations(&self.pool, execution_id).await
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemState {
    executions: HashMap<String, Execution>,
    artifacts: Vec<TestArtifact>,
    execution_reports: Vec<ExecutionReport>,
    test_reports: Vec<TestReport>,
    logs: Vec<LogEntryRow>,
    recommendations: Vec<Recommendation>,
}

/// In-process [`Database`] used in simulate mode and in tests.
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<MemState>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn upsert_execution(
        &self,
        id: &str,
        api_id: Option<&str>,
        test_file_path: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .executions
            .entry(id.to_string())
            .or_insert_with(|| Execution {
                id: id.to_string(),
                status: ExecutionStatus::Queued,
                progress: 0.0,
                api_id: api_id.map(str::to_owned),
                test_file_path: test_file_path.map(str::to_owned),
                message: None,
                started_at: Utc::now(),
                updated_at: Utc::now(),
            });
        Ok(())
    }

    async fn mark_execution_running(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(id) {
            if !execution.status.is_terminal() {
                execution.status = ExecutionStatus::Running;
                execution.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_execution_progress(&self, id: &str, progress: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(id) {
            execution.progress = progress;
            execution.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finish_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.executions.get_mut(id) {
            Some(execution) if !execution.status.is_terminal() => {
                execution.status = status;
                execution.message = message.map(str::to_owned);
                execution.progress = 1.0;
                execution.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let state = self.state.lock().await;
        Ok(state.executions.get(id).cloned())
    }

    async fn insert_test_artifact(
        &self,
        title: &str,
        file_path: &str,
        provider: ArtifactProvider,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.artifacts.push(TestArtifact {
            id: Uuid::new_v4(),
            title: title.to_string(),
            file_path: file_path.to_string(),
            provider,
            metadata,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn insert_execution_report(
        &self,
        execution_id: &str,
        artifact_path: &str,
        status: ExecutionStatus,
        summary: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.execution_reports.push(ExecutionReport {
            id: Uuid::new_v4(),
            execution_id: execution_id.to_string(),
            artifact_path: artifact_path.to_string(),
            status,
            summary: summary.map(str::to_owned),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_execution_reports(&self, execution_id: &str) -> Result<Vec<ExecutionReport>> {
        let state = self.state.lock().await;
        Ok(state
            .execution_reports
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn insert_test_report(
        &self,
        execution_id: &str,
        report_type: ReportType,
        file_path: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.test_reports.push(TestReport {
            id: Uuid::new_v4(),
            execution_id: execution_id.to_string(),
            report_type,
            file_path: file_path.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn insert_log_entry(&self, record: &LogRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.logs.push(LogEntryRow {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            level: record.level,
            message: record.message.clone(),
            context: record.context.clone(),
            source_type: record.source.agent_type.to_string(),
            source_instance: record.source.instance.clone(),
            source_node: record.source.node.clone(),
            tags: record.tags.clone(),
            correlation_id: record.correlation_id.clone(),
        });
        Ok(())
    }

    async fn query_log_entries(
        &self,
        level: Option<LogLevel>,
        message_like: Option<&str>,
        limit: i64,
    ) -> Result<Vec<LogEntryRow>> {
        let state = self.state.lock().await;
        let mut rows: Vec<LogEntryRow> = state
            .logs
            .iter()
            .filter(|row| level.is_none_or(|l| row.level == l))
            .filter(|row| message_like.is_none_or(|q| row.message.contains(q)))
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn insert_recommendation(
        &self,
        execution_id: &str,
        kind: &str,
        severity: RecommendationSeverity,
        details: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.recommendations.push(Recommendation {
            id: Uuid::new_v4(),
            execution_id: execution_id.to_string(),
            kind: kind.to_string(),
            severity,
            details: details.map(str::to_owned),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_recommendations(&self, execution_id: &str) -> Result<Vec<Recommendation>> {
        let state = self.state.lock().await;
        Ok(state
            .recommendations
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }
}
