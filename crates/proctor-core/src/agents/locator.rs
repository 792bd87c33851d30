//! Locator agent: scores and ranks candidate selectors from element
//! descriptors.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::debug;

use crate::bus::{Delivery, PriorityBus};
use crate::config::LocatorConfig;
use crate::events::{Event, EventChannel};
use crate::message::{
    AgentIdentity, AgentType, LocatorCandidates, LocatorSynthesisRequest, Message, MessagePayload,
    ScoredSelector,
};
use crate::runtime::Agent;
use crate::selector::{
    ElementDescriptor, id_selector, role_selector, tag_class_selector, testid_selector,
    text_selector,
};

/// Score and rank candidate selectors for one element descriptor.
///
/// Base scores: `data-testid` 10, `role` 8, `id` 7, `text` 5, tag+class 3,
/// bare tag 1. Configured boosts add +5 to `[data-testid=...]` and +2 to
/// `role=...` candidates. The result is deduped by selector keeping the
/// maximum score, then sorted by descending score (selector as tie break).
pub fn score_candidates(
    element: &ElementDescriptor,
    config: &LocatorConfig,
) -> Vec<ScoredSelector> {
    let mut candidates: Vec<ScoredSelector> = Vec::new();
    let mut push = |selector: String, score: i64| {
        candidates.push(ScoredSelector { selector, score });
    };

    let testid_boost = if config.prefer_testid { 5 } else { 0 };
    let role_boost = if config.prefer_role { 2 } else { 0 };

    if let Some(testid) = &element.data_testid {
        push(testid_selector(testid), 10 + testid_boost);
    }
    if let Some(role) = &element.role {
        push(
            role_selector(role, element.name.as_deref()),
            8 + role_boost,
        );
    }
    if let Some(id) = &element.id {
        push(id_selector(id), 7);
    }
    if let Some(text) = &element.text {
        push(text_selector(text), 5);
    }
    if let Some(tag) = &element.tag {
        if let Some(selector) = element
            .class
            .as_deref()
            .and_then(|class| tag_class_selector(tag, class))
        {
            push(selector, 3);
        }
        push(tag.clone(), 1);
    }

    // Dedup by selector keeping the max score.
    let mut best: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for candidate in candidates {
        let entry = best.entry(candidate.selector).or_insert(candidate.score);
        *entry = (*entry).max(candidate.score);
    }
    let mut ranked: Vec<ScoredSelector> = best
        .into_iter()
        .map(|(selector, score)| ScoredSelector { selector, score })
        .collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score).then(a.selector.cmp(&b.selector)));
    ranked
}

pub struct LocatorAgent {
    identity: AgentIdentity,
    bus: Arc<PriorityBus>,
    events: EventChannel,
    config: LocatorConfig,
}

impl LocatorAgent {
    pub fn new(bus: Arc<PriorityBus>, events: EventChannel, config: LocatorConfig) -> Self {
        Self {
            identity: AgentIdentity::local(AgentType::Locator),
            bus,
            events,
            config,
        }
    }

    async fn handle_synthesis(&self, request: &LocatorSynthesisRequest) -> Result<()> {
        let candidates = score_candidates(&request.element, &self.config);
        debug!(
            request_id = %request.request_id,
            count = candidates.len(),
            "locator candidates synthesized"
        );

        self.events.publish(Event::LocatorSynthesisCompleted {
            top: candidates.first().map(|c| c.selector.clone()),
            candidate_count: candidates.len(),
        });

        // The request context is echoed back untouched so the optimizer can
        // correlate the response with its pending state.
        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Optimizer,
                MessagePayload::LocatorCandidates(LocatorCandidates {
                    context: request.context.clone(),
                    candidates,
                }),
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Agent for LocatorAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Locator
    }

    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message.payload {
            MessagePayload::LocatorSynthesisRequest(request) => {
                self.handle_synthesis(request).await
            }
            other => bail!("locator cannot handle {}", other.kind()),
        }
    }
}
