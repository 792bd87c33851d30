//! Logger agent: persists structured log rows and appends a JSON-per-line
//! syslog entry. The syslog append is best-effort and never blocks
//! acknowledgement.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use proctor_db::models::LogLevel;

use crate::bus::Delivery;
use crate::config::LoggerConfig;
use crate::db::{Database, LogRecord};
use crate::events::{Event, EventChannel};
use crate::message::{AgentIdentity, AgentType, LogEntryPayload, MessagePayload};
use crate::runtime::Agent;

pub struct LoggerAgent {
    identity: AgentIdentity,
    events: EventChannel,
    db: Arc<dyn Database>,
    config: LoggerConfig,
}

impl LoggerAgent {
    pub fn new(events: EventChannel, db: Arc<dyn Database>, config: LoggerConfig) -> Self {
        Self {
            identity: AgentIdentity::local(AgentType::Logger),
            events,
            db,
            config,
        }
    }

    async fn append_syslog(&self, entry: &serde_json::Value) {
        let write = async {
            if let Some(parent) = self.config.syslog_path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.syslog_path)
                .await?;
            file.write_all(format!("{entry}\n").as_bytes()).await?;
            Ok::<(), std::io::Error>(())
        };
        if let Err(e) = write.await {
            // Best-effort: a broken syslog file must not fail the message.
            warn!(
                path = %self.config.syslog_path.display(),
                error = %e,
                "syslog append failed"
            );
        }
    }

    async fn handle_entry(&self, source: &AgentIdentity, payload: &LogEntryPayload) -> Result<()> {
        let level = LogLevel::from_str(&payload.level).unwrap_or(LogLevel::Info);
        let record = LogRecord {
            level,
            message: payload.message.clone(),
            context: payload.context.clone(),
            source: source.clone(),
            tags: payload.tags.clone(),
            correlation_id: payload.correlation_id.clone(),
        };
        self.db.insert_log_entry(&record).await?;

        let line = serde_json::json!({
            "ts": Utc::now(),
            "level": level,
            "message": payload.message,
            "source": source,
            "correlation_id": payload.correlation_id,
        });
        self.append_syslog(&line).await;
        Ok(())
    }

    async fn handle_query(
        &self,
        level: Option<&str>,
        query: Option<&str>,
        limit: Option<i64>,
    ) -> Result<()> {
        let level = level.and_then(|raw| LogLevel::from_str(raw).ok());
        let limit = limit
            .unwrap_or(100)
            .clamp(1, self.config.max_query_limit);

        let rows = self.db.query_log_entries(level, query, limit).await?;
        debug!(matched = rows.len(), "log query completed");
        self.events.publish(Event::LogQueryCompleted {
            matched: rows.len(),
        });
        Ok(())
    }
}

#[async_trait]
impl Agent for LoggerAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Logger
    }

    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message.payload {
            MessagePayload::LogEntry(payload) => {
                self.handle_entry(&delivery.message.source, payload).await
            }
            MessagePayload::QueryLogs { level, query, limit } => {
                self.handle_query(level.as_deref(), query.as_deref(), *limit)
                    .await
            }
            other => bail!("logger cannot handle {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;

    fn payload(level: &str, message: &str) -> LogEntryPayload {
        LogEntryPayload {
            level: level.to_string(),
            message: message.to_string(),
            context: serde_json::json!({}),
            tags: vec!["pipeline".to_string()],
            correlation_id: Some("corr-1".to_string()),
        }
    }

    fn logger(syslog: std::path::PathBuf) -> (LoggerAgent, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::new());
        let agent = LoggerAgent::new(
            EventChannel::default(),
            Arc::clone(&db) as Arc<dyn Database>,
            LoggerConfig {
                syslog_path: syslog,
                ..LoggerConfig::default()
            },
        );
        (agent, db)
    }

    #[tokio::test]
    async fn persists_the_row_and_appends_one_syslog_line() {
        let tmp = tempfile::tempdir().unwrap();
        let syslog = tmp.path().join("syslog.jsonl");
        let (agent, db) = logger(syslog.clone());
        let source = AgentIdentity::local(AgentType::Executor);

        agent
            .handle_entry(&source, &payload("error", "selector timeout"))
            .await
            .unwrap();

        let rows = db
            .query_log_entries(Some(LogLevel::Error), None, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(rows[0].tags, vec!["pipeline".to_string()]);

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&syslog)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["message"], "selector timeout");
    }

    #[tokio::test]
    async fn unwritable_syslog_does_not_fail_the_message() {
        let (agent, db) = logger(std::path::PathBuf::from("/proc/definitely/not/writable"));
        let source = AgentIdentity::local(AgentType::Executor);

        agent
            .handle_entry(&source, &payload("info", "still persisted"))
            .await
            .unwrap();

        let rows = db.query_log_entries(None, None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn unknown_level_defaults_to_info() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, db) = logger(tmp.path().join("s.jsonl"));
        let source = AgentIdentity::local(AgentType::Writer);

        agent
            .handle_entry(&source, &payload("shouting", "hello"))
            .await
            .unwrap();

        let rows = db
            .query_log_entries(Some(LogLevel::Info), None, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn query_publishes_a_completion_event() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, _db) = logger(tmp.path().join("s.jsonl"));
        let mut events = agent.events.subscribe();

        agent.handle_query(Some("error"), Some("nope"), None).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, Event::LogQueryCompleted { matched: 0 });
    }
}
