//! Executor agent: runs test executions, tracks progress, honors advisory
//! cancellation, and fans results out to the rest of the pipeline.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use proctor_db::models::ExecutionStatus;

use crate::bus::{Delivery, PriorityBus};
use crate::config::{ExecutorConfig, ExecutorMode};
use crate::db::Database;
use crate::events::{Event, EventChannel};
use crate::message::{
    AgentIdentity, AgentType, ExecutionRequest, ExecutionResult, Message, MessagePayload,
    RunStatus,
};
use crate::runner::{RunRequest, Runner};
use crate::runtime::Agent;

/// How one run ended, before it is mapped to statuses and summaries.
enum RunOutcome {
    Passed,
    /// Simulate mode skipped the runner entirely.
    Simulated,
    Failed(i32),
    SpawnFailed(String),
    Canceled,
    TimedOut,
}

pub struct ExecutorAgent {
    identity: AgentIdentity,
    bus: Arc<PriorityBus>,
    events: EventChannel,
    db: Arc<dyn Database>,
    runner: Arc<dyn Runner>,
    config: ExecutorConfig,
    /// Advisory cancellation set, polled while a run is in flight.
    canceled: Mutex<HashSet<String>>,
}

impl ExecutorAgent {
    pub fn new(
        bus: Arc<PriorityBus>,
        events: EventChannel,
        db: Arc<dyn Database>,
        runner: Arc<dyn Runner>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            identity: AgentIdentity::local(AgentType::Executor),
            bus,
            events,
            db,
            runner,
            config,
            canceled: Mutex::new(HashSet::new()),
        }
    }

    fn is_canceled(&self, execution_id: &str) -> bool {
        self.canceled
            .lock()
            .map(|set| set.contains(execution_id))
            .unwrap_or(false)
    }

    fn clear_cancel(&self, execution_id: &str) {
        if let Ok(mut set) = self.canceled.lock() {
            set.remove(execution_id);
        }
    }

    fn record_cancel(&self, execution_id: &str) {
        if let Ok(mut set) = self.canceled.lock() {
            set.insert(execution_id.to_string());
        }
        info!(execution_id, "cancellation requested");
    }

    async fn handle_request(&self, request: &ExecutionRequest) -> Result<()> {
        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| format!("exec-{}", Uuid::new_v4().simple()));

        self.db
            .upsert_execution(
                &execution_id,
                request.execution_id.as_deref(),
                request.test_file_path.as_deref(),
            )
            .await
            .context("failed to record execution")?;
        self.db.mark_execution_running(&execution_id).await?;
        self.db
            .update_execution_progress(&execution_id, 0.1)
            .await?;

        // Pre-flight cancellation: terminate before any work happens. No
        // report artifact is produced and no follow-up work is enqueued.
        if self.is_canceled(&execution_id) {
            self.clear_cancel(&execution_id);
            info!(%execution_id, "execution canceled before start");
            self.events.publish(Event::ExecutionCompleted {
                execution_id: execution_id.clone(),
                status: RunStatus::Skipped,
                summary: "canceled before start".to_string(),
            });
            self.db
                .finish_execution(&execution_id, ExecutionStatus::Canceled, Some("canceled"))
                .await?;
            return Ok(());
        }

        let (outcome, artifact_path) = match self.config.mode {
            ExecutorMode::Simulate => self.run_simulated(&execution_id).await?,
            ExecutorMode::Process => self.run_process(&execution_id, request).await?,
        };

        let (status, summary) = match &outcome {
            RunOutcome::Passed => (RunStatus::Passed, "passed".to_string()),
            RunOutcome::Simulated => (RunStatus::Passed, "simulated".to_string()),
            RunOutcome::Failed(code) => (RunStatus::Failed, format!("failed: exit code {code}")),
            RunOutcome::SpawnFailed(message) => {
                (RunStatus::Failed, format!("runner failed to start: {message}"))
            }
            RunOutcome::Canceled => (RunStatus::Skipped, "canceled".to_string()),
            RunOutcome::TimedOut => (
                RunStatus::Failed,
                format!("timed out after {:?}", self.config.timeout),
            ),
        };
        if matches!(outcome, RunOutcome::Canceled) {
            self.clear_cancel(&execution_id);
        }

        self.db
            .update_execution_progress(&execution_id, 1.0)
            .await?;
        self.db
            .insert_execution_report(
                &execution_id,
                &artifact_path.to_string_lossy(),
                run_status_to_terminal(status),
                Some(&summary),
            )
            .await?;

        info!(%execution_id, status = %status, summary = %summary, "execution completed");
        self.events.publish(Event::ExecutionCompleted {
            execution_id: execution_id.clone(),
            status,
            summary: summary.clone(),
        });

        if status == RunStatus::Failed {
            self.bus
                .send(Message::new(
                    self.identity.clone(),
                    AgentType::Context,
                    MessagePayload::ExecutionFailure {
                        execution_id: execution_id.clone(),
                        summary: summary.clone(),
                    },
                ))
                .await?;
        }

        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Optimizer,
                MessagePayload::ExecutionResult(ExecutionResult {
                    execution_id: execution_id.clone(),
                    status,
                    summary: summary.clone(),
                    failed_tests: None,
                }),
            ))
            .await?;

        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Reporter,
                MessagePayload::GenerateReport {
                    execution_id: execution_id.clone(),
                },
            ))
            .await?;

        self.db
            .finish_execution(
                &execution_id,
                run_status_to_terminal(status),
                Some(&summary),
            )
            .await?;

        Ok(())
    }

    /// Simulate mode: write a trivial HTML report without running anything.
    async fn run_simulated(&self, execution_id: &str) -> Result<(RunOutcome, PathBuf)> {
        self.db.update_execution_progress(execution_id, 0.5).await?;

        let path = self.config.report_dir.join(format!("{execution_id}.html"));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let html = format!(
            "<!DOCTYPE html><html><body><h1>Execution {execution_id}</h1><p>simulated</p></body></html>"
        );
        tokio::fs::write(&path, html)
            .await
            .with_context(|| format!("failed to write simulated report {}", path.display()))?;
        Ok((RunOutcome::Simulated, path))
    }

    /// Process mode: spawn the runner collaborator and poll it to
    /// completion, checking the cancellation set and the hard timeout on a
    /// coarse tick.
    async fn run_process(
        &self,
        execution_id: &str,
        request: &ExecutionRequest,
    ) -> Result<(RunOutcome, PathBuf)> {
        let report_dir = self.config.report_dir.join(execution_id);
        let artifact_path = report_dir.join("index.html");

        let mut env = HashMap::new();
        env.insert("PROCTOR_EXECUTION_ID".to_string(), execution_id.to_string());
        let run_request = RunRequest {
            tests_dir: self.config.tests_dir.clone(),
            report_dir: report_dir.clone(),
            grep: request
                .grep
                .clone()
                .or_else(|| request.test_file_path.clone()),
            env,
        };

        let handle = match self.runner.spawn(&run_request).await {
            Ok(handle) => handle,
            Err(e) => {
                // Collaborator failure: classify, do not retry the message.
                warn!(execution_id, error = %format!("{e:#}"), "runner spawn failed");
                return Ok((RunOutcome::SpawnFailed(format!("{e:#}")), artifact_path));
            }
        };

        let started = Instant::now();
        let mut halfway_reported = false;
        let outcome = loop {
            if self.is_canceled(execution_id) {
                if let Err(e) = self.runner.kill(&handle).await {
                    warn!(execution_id, error = %e, "failed to kill canceled run");
                }
                break RunOutcome::Canceled;
            }
            if started.elapsed() >= self.config.timeout {
                warn!(execution_id, "execution timed out, killing runner");
                if let Err(e) = self.runner.kill(&handle).await {
                    warn!(execution_id, error = %e, "failed to kill timed-out run");
                }
                break RunOutcome::TimedOut;
            }
            if !halfway_reported && started.elapsed() >= self.config.timeout / 2 {
                halfway_reported = true;
                self.db.update_execution_progress(execution_id, 0.5).await?;
            }
            if let Some(code) = self.runner.try_wait(&handle).await? {
                break if code == 0 {
                    RunOutcome::Passed
                } else {
                    RunOutcome::Failed(code)
                };
            }
            tokio::time::sleep(self.config.cancel_poll).await;
        };

        Ok((outcome, artifact_path))
    }
}

fn run_status_to_terminal(status: RunStatus) -> ExecutionStatus {
    match status {
        RunStatus::Passed => ExecutionStatus::Passed,
        RunStatus::Failed => ExecutionStatus::Failed,
        RunStatus::Skipped => ExecutionStatus::Canceled,
    }
}

#[async_trait]
impl Agent for ExecutorAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Executor
    }

    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message.payload {
            MessagePayload::ExecutionRequest(request) => self.handle_request(request).await,
            MessagePayload::ExecutionCancel { execution_id } => {
                self.record_cancel(execution_id);
                Ok(())
            }
            other => bail!("executor cannot handle {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::store::MemoryStore;
    use crate::bus::BusConfig;
    use crate::db::MemoryDatabase;
    use std::time::Duration;

    struct NeverRunner;

    #[async_trait]
    impl Runner for NeverRunner {
        async fn spawn(&self, _request: &RunRequest) -> Result<crate::runner::RunHandle> {
            bail!("no runner in simulate tests")
        }

        async fn try_wait(&self, _handle: &crate::runner::RunHandle) -> Result<Option<i32>> {
            Ok(Some(-1))
        }

        async fn kill(&self, _handle: &crate::runner::RunHandle) -> Result<()> {
            Ok(())
        }
    }

    fn executor(report_dir: PathBuf) -> (ExecutorAgent, Arc<PriorityBus>, Arc<MemoryDatabase>) {
        let bus = Arc::new(PriorityBus::new(
            Arc::new(MemoryStore::new()),
            BusConfig::default(),
        ));
        let db = Arc::new(MemoryDatabase::new());
        let agent = ExecutorAgent::new(
            Arc::clone(&bus),
            EventChannel::default(),
            Arc::clone(&db) as Arc<dyn Database>,
            Arc::new(NeverRunner),
            ExecutorConfig {
                mode: ExecutorMode::Simulate,
                report_dir,
                ..ExecutorConfig::default()
            },
        );
        (agent, bus, db)
    }

    #[tokio::test]
    async fn simulated_run_passes_and_fans_out() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, bus, db) = executor(tmp.path().to_path_buf());
        let mut events = agent.events.subscribe();

        agent
            .handle_request(&ExecutionRequest {
                execution_id: Some("e-sim".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        // The trivial report exists.
        let report = tmp.path().join("e-sim.html");
        assert!(report.exists());

        // The record reached its terminal status exactly once.
        let row = db.get_execution("e-sim").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Passed);
        assert_eq!(row.progress, 1.0);

        // The persisted report row and the event both carry the simulate
        // summary, not the generic pass text.
        let reports = db.list_execution_reports("e-sim").await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].summary.as_deref(), Some("simulated"));
        match events.recv().await.unwrap() {
            Event::ExecutionCompleted { status, summary, .. } => {
                assert_eq!(status, RunStatus::Passed);
                assert_eq!(summary, "simulated");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Follow-ups: EXECUTION_RESULT then GENERATE_REPORT (no failure
        // message for a passing run).
        let kinds: Vec<&str> = {
            let mut kinds = Vec::new();
            while let Some(delivery) = bus.consume_next(Duration::from_millis(20)).await.unwrap() {
                kinds.push(delivery.message.kind());
            }
            kinds
        };
        assert_eq!(kinds, vec!["EXECUTION_RESULT", "GENERATE_REPORT"]);
    }

    #[tokio::test]
    async fn cancel_before_start_skips_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, bus, db) = executor(tmp.path().to_path_buf());
        let mut events = agent.events.subscribe();

        agent.record_cancel("e-cancel");
        agent
            .handle_request(&ExecutionRequest {
                execution_id: Some("e-cancel".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let row = db.get_execution("e-cancel").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Canceled);

        // Exactly one completion event with skipped status.
        let event = events.recv().await.unwrap();
        match event {
            Event::ExecutionCompleted { execution_id, status, .. } => {
                assert_eq!(execution_id, "e-cancel");
                assert_eq!(status, RunStatus::Skipped);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err(), "no further completion events");

        // No report artifact and no follow-up work.
        assert!(!tmp.path().join("e-cancel.html").exists());
        assert!(bus
            .consume_next(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cancellation_is_consumed_by_the_skipped_run() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, _bus, db) = executor(tmp.path().to_path_buf());

        agent.record_cancel("e-again");
        agent
            .handle_request(&ExecutionRequest {
                execution_id: Some("e-again".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!agent.is_canceled("e-again"));

        // A fresh id is unaffected by old cancellations.
        agent
            .handle_request(&ExecutionRequest {
                execution_id: Some("e-fresh".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let row = db.get_execution("e-fresh").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Passed);
    }

    #[tokio::test]
    async fn generated_ids_are_unique_per_request() {
        let tmp = tempfile::tempdir().unwrap();
        let (agent, bus, _db) = executor(tmp.path().to_path_buf());

        agent.handle_request(&ExecutionRequest::default()).await.unwrap();
        agent.handle_request(&ExecutionRequest::default()).await.unwrap();

        let mut ids = std::collections::HashSet::new();
        while let Some(delivery) = bus.consume_next(Duration::from_millis(20)).await.unwrap() {
            if let MessagePayload::ExecutionResult(result) = &delivery.message.payload {
                ids.insert(result.execution_id.clone());
            }
        }
        assert_eq!(ids.len(), 2);
    }
}
