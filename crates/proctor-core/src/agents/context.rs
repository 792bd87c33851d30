//! Context agent: namespaced key/value passthrough plus failure-context
//! capture feeding the optimizer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bus::{Delivery, PriorityBus};
use crate::message::{
    AgentIdentity, AgentType, ExecutionResult, Message, MessagePayload, OptimizeTestFile,
    RunStatus,
};
use crate::runtime::Agent;
use crate::state::SharedState;

/// TTL for failure contexts.
const FAILURE_CONTEXT_TTL: Duration = Duration::from_secs(3600);

/// The last observed failure for an execution, keyed
/// `ctx:lastFailure:<execution_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub summary: String,
    #[serde(default)]
    pub selector_guess: Option<String>,
    #[serde(default)]
    pub error_snippet: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    pub ts: DateTime<Utc>,
}

pub fn failure_context_key(execution_id: &str) -> String {
    format!("ctx:lastFailure:{execution_id}")
}

pub struct ContextAgent {
    identity: AgentIdentity,
    bus: Arc<PriorityBus>,
    state: SharedState,
}

impl ContextAgent {
    pub fn new(bus: Arc<PriorityBus>, state: SharedState) -> Self {
        Self {
            identity: AgentIdentity::local(AgentType::Context),
            bus,
            state,
        }
    }

    async fn handle_failure(&self, execution_id: &str, summary: &str) -> Result<()> {
        let context = FailureContext {
            summary: summary.to_string(),
            selector_guess: None,
            error_snippet: None,
            file: None,
            ts: Utc::now(),
        };
        self.state
            .set(
                &failure_context_key(execution_id),
                &context,
                Some(FAILURE_CONTEXT_TTL),
            )
            .await?;
        info!(execution_id, "failure context stored");

        // Forward to the optimizer as a failed result so its retry ladder
        // engages.
        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Optimizer,
                MessagePayload::ExecutionResult(ExecutionResult {
                    execution_id: execution_id.to_string(),
                    status: RunStatus::Failed,
                    summary: summary.to_string(),
                    failed_tests: None,
                }),
            ))
            .await?;
        Ok(())
    }

    /// An extended result carrying per-test failures: capture the richest
    /// context we have and hand the first failing test to the optimizer.
    async fn handle_result(&self, result: &ExecutionResult) -> Result<()> {
        let Some(first) = result
            .failed_tests
            .as_ref()
            .and_then(|tests| tests.first())
        else {
            debug!(
                execution_id = %result.execution_id,
                "result without failed tests, nothing to capture"
            );
            return Ok(());
        };

        let context = FailureContext {
            summary: result.summary.clone(),
            selector_guess: first.selector_guess.clone(),
            error_snippet: first.error_snippet.clone(),
            file: Some(first.file.clone()),
            ts: Utc::now(),
        };
        self.state
            .set(
                &failure_context_key(&result.execution_id),
                &context,
                Some(FAILURE_CONTEXT_TTL),
            )
            .await?;

        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Optimizer,
                MessagePayload::OptimizeTestFile(OptimizeTestFile {
                    execution_id: result.execution_id.clone(),
                    test_file_path: first.file.clone(),
                    original_selector: first.selector_guess.clone(),
                    rerun_attempt: None,
                }),
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Agent for ContextAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Context
    }

    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message.payload {
            MessagePayload::UpdateContext { key, value, ttl_secs } => {
                let ttl = ttl_secs.map(Duration::from_secs);
                self.state.set(&format!("ctx:{key}"), value, ttl).await?;
                Ok(())
            }
            MessagePayload::GetContext { key } => {
                let value: Option<serde_json::Value> =
                    self.state.get(&format!("ctx:{key}")).await?;
                debug!(%key, found = value.is_some(), "context read");
                Ok(())
            }
            MessagePayload::ExecutionFailure { execution_id, summary } => {
                self.handle_failure(execution_id, summary).await
            }
            MessagePayload::ExecutionResult(result) => self.handle_result(result).await,
            other => bail!("context cannot handle {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::store::MemoryStore;
    use crate::bus::BusConfig;
    use crate::message::FailedTest;
    use crate::state::StateConfig;

    fn agent() -> (ContextAgent, Arc<PriorityBus>, SharedState) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(PriorityBus::new(
            Arc::clone(&store) as Arc<dyn crate::bus::store::QueueStore>,
            BusConfig::default(),
        ));
        let state = SharedState::new(store, StateConfig::default());
        let agent = ContextAgent::new(Arc::clone(&bus), state.clone());
        (agent, bus, state)
    }

    #[tokio::test]
    async fn failure_stores_context_and_notifies_the_optimizer() {
        let (agent, bus, state) = agent();

        agent.handle_failure("e1", "2 failed").await.unwrap();

        let stored: Option<FailureContext> =
            state.get(&failure_context_key("e1")).await.unwrap();
        assert_eq!(stored.unwrap().summary, "2 failed");

        let delivery = bus
            .consume_next(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.target.agent_type, "optimizer");
        match &delivery.message.payload {
            MessagePayload::ExecutionResult(result) => {
                assert_eq!(result.execution_id, "e1");
                assert_eq!(result.status, RunStatus::Failed);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn extended_result_forwards_the_first_failed_test() {
        let (agent, bus, state) = agent();

        agent
            .handle_result(&ExecutionResult {
                execution_id: "e2".to_string(),
                status: RunStatus::Failed,
                summary: "1 failed".to_string(),
                failed_tests: Some(vec![
                    FailedTest {
                        file: "tests/header.spec.ts".to_string(),
                        test_name: Some("shows the banner".to_string()),
                        selector_guess: Some("getByRole('banner')".to_string()),
                        error_snippet: Some("locator not found".to_string()),
                    },
                    FailedTest {
                        file: "tests/footer.spec.ts".to_string(),
                        ..Default::default()
                    },
                ]),
            })
            .await
            .unwrap();

        let stored: Option<FailureContext> =
            state.get(&failure_context_key("e2")).await.unwrap();
        let stored = stored.unwrap();
        assert_eq!(stored.file.as_deref(), Some("tests/header.spec.ts"));
        assert_eq!(stored.selector_guess.as_deref(), Some("getByRole('banner')"));

        let delivery = bus
            .consume_next(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        match &delivery.message.payload {
            MessagePayload::OptimizeTestFile(req) => {
                assert_eq!(req.execution_id, "e2");
                assert_eq!(req.test_file_path, "tests/header.spec.ts");
                assert_eq!(req.original_selector.as_deref(), Some("getByRole('banner')"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn result_without_failures_is_ignored() {
        let (agent, bus, _state) = agent();
        agent
            .handle_result(&ExecutionResult {
                execution_id: "e3".to_string(),
                status: RunStatus::Passed,
                summary: "ok".to_string(),
                failed_tests: None,
            })
            .await
            .unwrap();
        assert!(bus
            .consume_next(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_and_get_context_passthrough() {
        let (agent, _bus, state) = agent();

        let delivery = Delivery {
            message: Message::new(
                AgentIdentity::local(AgentType::Logger),
                AgentType::Context,
                MessagePayload::UpdateContext {
                    key: "deploy:latest".to_string(),
                    value: serde_json::json!({"sha": "abc"}),
                    ttl_secs: Some(60),
                },
            ),
            queue: "queue:default".to_string(),
            attempts: 1,
        };
        agent.on_message(&delivery).await.unwrap();

        let stored: Option<serde_json::Value> = state.get("ctx:deploy:latest").await.unwrap();
        assert_eq!(stored, Some(serde_json::json!({"sha": "abc"})));
    }
}
