//! Optimizer agent: failure-driven retries with backoff, and locator
//! rewriting driven by ranked candidates from the locator agent.
//!
//! Per-execution state lives in shared storage: `execAttempts:<id>` counts
//! retry attempts, `opt:pending:<id>` tracks candidate progress. Both are
//! owned exclusively by this agent; a single instance is assumed, so plain
//! read-modify-write is sufficient.

use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use proctor_db::models::RecommendationSeverity;

use crate::agents::context::{FailureContext, failure_context_key};
use crate::bus::{Delivery, PriorityBus};
use crate::config::OptimizerConfig;
use crate::db::Database;
use crate::message::{
    AgentIdentity, AgentType, ExecutionRequest, ExecutionResult, LocatorCandidates,
    LocatorContext, LocatorSynthesisRequest, Message, MessagePayload, OptimizationContext,
    OptimizeTestFile, RunStatus,
};
use crate::runtime::Agent;
use crate::selector::{
    ElementDescriptor, descriptor_from_selector, fallback_candidates, selector_to_locator_call,
};
use crate::state::SharedState;

/// Marker appended to a test file after each rewrite. A file already
/// carrying the marker for a replacement is never patched twice.
const PATCH_MARKER: &str = "// OPTIMIZER_PATCH:";

/// Candidate progress for one execution, keyed `opt:pending:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOptimization {
    pub test_file_path: String,
    pub original_selector: String,
    pub element: ElementDescriptor,
    pub candidate_index: usize,
    pub candidates: Vec<String>,
    #[serde(default)]
    pub last_applied: Option<String>,
    pub attempt_number: u64,
}

pub fn pending_key(execution_id: &str) -> String {
    format!("opt:pending:{execution_id}")
}

pub fn attempts_key(execution_id: &str) -> String {
    format!("execAttempts:{execution_id}")
}

pub struct OptimizerAgent {
    identity: AgentIdentity,
    bus: Arc<PriorityBus>,
    state: SharedState,
    db: Arc<dyn Database>,
    config: OptimizerConfig,
}

impl OptimizerAgent {
    pub fn new(
        bus: Arc<PriorityBus>,
        state: SharedState,
        db: Arc<dyn Database>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            identity: AgentIdentity::local(AgentType::Optimizer),
            bus,
            state,
            db,
            config,
        }
    }

    /// Retry ladder for terminal results. Passing runs reset the attempt
    /// counter; failing runs are re-enqueued with backoff until the
    /// allowance is spent, at which point a flaky-test recommendation is
    /// recorded instead.
    async fn handle_result(&self, result: &ExecutionResult) -> Result<()> {
        let execution_id = &result.execution_id;

        if result.status == RunStatus::Passed {
            self.state
                .set(
                    &attempts_key(execution_id),
                    &0u64,
                    Some(self.config.attempts_ttl),
                )
                .await?;
            return Ok(());
        }
        if result.status == RunStatus::Skipped {
            return Ok(());
        }

        let attempts: u64 = self
            .state
            .get(&attempts_key(execution_id))
            .await?
            .unwrap_or(0);

        if attempts == 0 {
            // First observed failure for this execution.
            self.db
                .insert_recommendation(
                    execution_id,
                    "increase-retries",
                    RecommendationSeverity::Medium,
                    Some(&result.summary),
                )
                .await?;
        }

        let next = attempts + 1;
        if next <= self.config.max_attempts {
            self.state
                .set(
                    &attempts_key(execution_id),
                    &next,
                    Some(self.config.attempts_ttl),
                )
                .await?;
            info!(%execution_id, attempt = next, "scheduling execution retry");
            tokio::time::sleep(self.config.backoff).await;
            self.bus
                .send(Message::new(
                    self.identity.clone(),
                    AgentType::Executor,
                    MessagePayload::ExecutionRequest(ExecutionRequest {
                        execution_id: Some(execution_id.clone()),
                        rerun_attempt: Some(next as u32),
                        ..Default::default()
                    }),
                ))
                .await?;
        } else {
            info!(%execution_id, attempts, "retry allowance spent");
            self.db
                .insert_recommendation(
                    execution_id,
                    "investigate-flaky",
                    RecommendationSeverity::High,
                    Some(&result.summary),
                )
                .await?;
        }
        Ok(())
    }

    /// Re-drive optimization for every execution with a live failure
    /// context.
    async fn handle_optimize_recent(&self) -> Result<()> {
        let keys = self.state.scan("ctx:lastFailure:").await?;
        debug!(count = keys.len(), "optimizing recent failures");
        for key in keys {
            let Some(context) = self.state.get::<FailureContext>(&key).await? else {
                continue;
            };
            let Some(file) = context.file else {
                continue;
            };
            let Some(execution_id) = key.strip_prefix("ctx:lastFailure:") else {
                continue;
            };
            self.bus
                .send(Message::new(
                    self.identity.clone(),
                    AgentType::Optimizer,
                    MessagePayload::OptimizeTestFile(OptimizeTestFile {
                        execution_id: execution_id.to_string(),
                        test_file_path: file,
                        original_selector: context.selector_guess,
                        rerun_attempt: None,
                    }),
                ))
                .await?;
        }
        Ok(())
    }

    /// Start (or refresh) a rewrite cycle: derive the element descriptor,
    /// bump the attempt number, and request locator candidates.
    async fn handle_optimize_file(&self, request: &OptimizeTestFile) -> Result<()> {
        let execution_id = &request.execution_id;

        let failure: Option<FailureContext> =
            self.state.get(&failure_context_key(execution_id)).await?;

        let original_selector = request
            .original_selector
            .clone()
            .or_else(|| failure.as_ref().and_then(|f| f.selector_guess.clone()))
            .unwrap_or_default();
        let element = descriptor_from_selector(&original_selector);

        let mut pending: PendingOptimization = self
            .state
            .get(&pending_key(execution_id))
            .await?
            .unwrap_or_else(|| PendingOptimization {
                test_file_path: request.test_file_path.clone(),
                original_selector: original_selector.clone(),
                element: element.clone(),
                candidate_index: 0,
                candidates: Vec::new(),
                last_applied: None,
                attempt_number: 0,
            });
        pending.attempt_number += 1;
        self.state
            .set(
                &pending_key(execution_id),
                &pending,
                Some(self.config.pending_ttl),
            )
            .await?;

        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Locator,
                MessagePayload::LocatorSynthesisRequest(LocatorSynthesisRequest {
                    request_id: Uuid::new_v4(),
                    element: pending.element.clone(),
                    context: LocatorContext {
                        optimization_context: Some(OptimizationContext {
                            execution_id: execution_id.clone(),
                            test_file_path: pending.test_file_path.clone(),
                            original_selector: pending.original_selector.clone(),
                            attempt_number: pending.attempt_number,
                        }),
                    },
                }),
            ))
            .await?;
        Ok(())
    }

    /// Apply the next candidate to the test file.
    ///
    /// Stale responses (attempt number behind the pending state) are
    /// dropped without touching anything; a file already carrying the
    /// patch marker for the chosen replacement only advances the index.
    async fn handle_candidates(&self, response: &LocatorCandidates) -> Result<()> {
        let Some(octx) = &response.context.optimization_context else {
            debug!("locator candidates without optimization context, ignoring");
            return Ok(());
        };
        let execution_id = &octx.execution_id;

        let Some(mut pending) = self
            .state
            .get::<PendingOptimization>(&pending_key(execution_id))
            .await?
        else {
            debug!(%execution_id, "no pending optimization, response expired");
            return Ok(());
        };

        if octx.attempt_number < pending.attempt_number {
            debug!(
                %execution_id,
                response_attempt = octx.attempt_number,
                pending_attempt = pending.attempt_number,
                "stale locator response dropped"
            );
            return Ok(());
        }

        // Merge, preserving order, dropping duplicates and any candidate
        // that maps back onto the selector being replaced.
        for candidate in &response.candidates {
            if candidate.selector == pending.original_selector
                || selector_to_locator_call(&candidate.selector) == pending.original_selector
            {
                continue;
            }
            if !pending.candidates.contains(&candidate.selector) {
                pending.candidates.push(candidate.selector.clone());
            }
        }

        let index = pending.candidate_index;
        let selector = if index < pending.candidates.len() {
            pending.candidates[index].clone()
        } else {
            let fallback = fallback_candidates(&pending.element, &pending.original_selector);
            let overflow = index - pending.candidates.len();
            match fallback.get(overflow) {
                Some(selector) => selector.clone(),
                None => {
                    warn!(%execution_id, index, "candidate list exhausted");
                    return Ok(());
                }
            }
        };
        let replacement = selector_to_locator_call(&selector);

        let content = tokio::fs::read_to_string(&pending.test_file_path)
            .await
            .with_context(|| format!("failed to read test file {}", pending.test_file_path))?;

        let marker_needle = format!(
            "{PATCH_MARKER} {} => {}",
            pending.original_selector, replacement
        );
        if content.contains(&marker_needle) {
            // Already applied once for this (execution, replacement) pair:
            // advance past it and wait for the next response.
            pending.candidate_index = index + 1;
            self.state
                .set(
                    &pending_key(execution_id),
                    &pending,
                    Some(self.config.pending_ttl),
                )
                .await?;
            debug!(%execution_id, %replacement, "replacement already applied, advancing");
            return Ok(());
        }

        if !content.contains(&pending.original_selector) {
            warn!(
                %execution_id,
                selector = %pending.original_selector,
                "original selector not found in test file"
            );
            return Ok(());
        }

        let mut patched = content.replacen(&pending.original_selector, &replacement, 1);
        if !patched.ends_with('\n') {
            patched.push('\n');
        }
        patched.push_str(&format!("{marker_needle} [candidateIndex={index}]\n"));
        tokio::fs::write(&pending.test_file_path, patched)
            .await
            .with_context(|| format!("failed to write test file {}", pending.test_file_path))?;

        pending.candidate_index = index + 1;
        pending.last_applied = Some(replacement.clone());
        self.state
            .set(
                &pending_key(execution_id),
                &pending,
                Some(self.config.pending_ttl),
            )
            .await?;

        info!(
            %execution_id,
            original = %pending.original_selector,
            replacement = %replacement,
            candidate_index = index,
            "locator rewritten, re-running test file"
        );
        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Executor,
                MessagePayload::ExecutionRequest(ExecutionRequest {
                    execution_id: Some(execution_id.clone()),
                    test_file_path: Some(pending.test_file_path.clone()),
                    optimization_rerun: true,
                    ..Default::default()
                }),
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Agent for OptimizerAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Optimizer
    }

    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message.payload {
            MessagePayload::ExecutionResult(result) => self.handle_result(result).await,
            MessagePayload::OptimizeRecent {} => self.handle_optimize_recent().await,
            MessagePayload::OptimizeTestFile(request) => self.handle_optimize_file(request).await,
            MessagePayload::LocatorCandidates(response) => self.handle_candidates(response).await,
            other => bail!("optimizer cannot handle {}", other.kind()),
        }
    }
}
