//! Reporter agent: materializes a durable JSON summary per execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use proctor_db::models::ReportType;

use crate::bus::Delivery;
use crate::db::Database;
use crate::events::{Event, EventChannel};
use crate::message::{AgentIdentity, AgentType, MessagePayload};
use crate::runtime::Agent;

pub struct ReporterAgent {
    identity: AgentIdentity,
    events: EventChannel,
    db: Arc<dyn Database>,
    report_dir: PathBuf,
}

/// Express `path` relative to the current working root when possible,
/// normalized to forward slashes.
fn relative_report_path(path: &Path) -> String {
    let relative = std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(&cwd).ok().map(Path::to_path_buf))
        .unwrap_or_else(|| path.to_path_buf());
    relative.to_string_lossy().replace('\\', "/")
}

impl ReporterAgent {
    pub fn new(events: EventChannel, db: Arc<dyn Database>, report_dir: PathBuf) -> Self {
        Self {
            identity: AgentIdentity::local(AgentType::Reporter),
            events,
            db,
            report_dir,
        }
    }

    async fn handle_generate(&self, execution_id: &str) -> Result<()> {
        let reports = self.db.list_execution_reports(execution_id).await?;

        let summary = serde_json::json!({
            "executionId": execution_id,
            "reports": reports,
            "generatedAt": Utc::now(),
        });

        // Deterministic file name keyed by execution id: regenerating a
        // report overwrites the previous summary instead of duplicating it.
        let path = self.report_dir.join(format!("{execution_id}.summary.json"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(&summary)?)
            .await
            .with_context(|| format!("failed to write summary {}", path.display()))?;

        let stored_path = relative_report_path(&path);
        self.db
            .insert_test_report(execution_id, ReportType::Json, &stored_path)
            .await?;

        info!(execution_id, path = %stored_path, "summary report generated");
        self.events.publish(Event::ReportGenerated {
            execution_id: execution_id.to_string(),
            file_path: stored_path,
        });
        Ok(())
    }
}

#[async_trait]
impl Agent for ReporterAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Reporter
    }

    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message.payload {
            MessagePayload::GenerateReport { execution_id } => {
                self.handle_generate(execution_id).await
            }
            other => bail!("reporter cannot handle {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use proctor_db::models::ExecutionStatus;

    #[tokio::test]
    async fn writes_the_summary_and_persists_a_report_row() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new());

        db.upsert_execution("e1", None, None).await.unwrap();
        db.insert_execution_report(
            "e1",
            "reports/e1/index.html",
            ExecutionStatus::Passed,
            Some("12 passed"),
        )
        .await
        .unwrap();

        let agent = ReporterAgent::new(
            EventChannel::default(),
            Arc::clone(&db) as Arc<dyn Database>,
            tmp.path().to_path_buf(),
        );
        let mut events = agent.events.subscribe();

        agent.handle_generate("e1").await.unwrap();

        let path = tmp.path().join("e1.summary.json");
        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(summary["executionId"], "e1");
        assert_eq!(summary["reports"].as_array().unwrap().len(), 1);
        assert!(summary["generatedAt"].is_string());

        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "report.generated");
    }

    #[tokio::test]
    async fn regeneration_overwrites_the_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new());
        let agent = ReporterAgent::new(
            EventChannel::default(),
            Arc::clone(&db) as Arc<dyn Database>,
            tmp.path().to_path_buf(),
        );

        agent.handle_generate("e2").await.unwrap();
        agent.handle_generate("e2").await.unwrap();

        let files: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn report_paths_use_forward_slashes() {
        let path = Path::new("/somewhere/else/reports/e1.summary.json");
        assert_eq!(
            relative_report_path(path),
            "/somewhere/else/reports/e1.summary.json"
        );
    }
}
