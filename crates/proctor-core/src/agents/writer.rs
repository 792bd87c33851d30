//! Writer agent: turns a generation request into a test artifact and
//! enqueues its first execution.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::bus::{Delivery, PriorityBus};
use crate::db::Database;
use crate::events::{Event, EventChannel};
use crate::generator::{FallbackGenerator, GeneratedArtifact, Generator};
use crate::message::{
    AgentIdentity, AgentType, ExecutionRequest, Message, MessagePayload, TestGenerationRequest,
};
use crate::runtime::Agent;

pub struct WriterAgent {
    identity: AgentIdentity,
    bus: Arc<PriorityBus>,
    events: EventChannel,
    db: Arc<dyn Database>,
    /// Model-backed generator, if configured. `None` means fallback-only.
    generator: Option<Arc<dyn Generator>>,
    tests_dir: PathBuf,
}

impl WriterAgent {
    pub fn new(
        bus: Arc<PriorityBus>,
        events: EventChannel,
        db: Arc<dyn Database>,
        generator: Option<Arc<dyn Generator>>,
        tests_dir: PathBuf,
    ) -> Self {
        Self {
            identity: AgentIdentity::local(AgentType::Writer),
            bus,
            events,
            db,
            generator,
            tests_dir,
        }
    }

    /// Deterministic artifact file name: the same repo and commit always
    /// write the same file, keeping redelivered requests effect-idempotent.
    fn artifact_path(&self, request: &TestGenerationRequest) -> PathBuf {
        let slug: String = format!("{}-{}", request.repo, request.head_commit)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let slug = slug.trim_matches('-').to_string();
        self.tests_dir.join(format!("{slug}.spec.ts"))
    }

    async fn produce(&self, request: &TestGenerationRequest) -> GeneratedArtifact {
        match &self.generator {
            Some(generator) => match generator.generate(request).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "generator failed, using fallback artifact");
                    FallbackGenerator::artifact(request)
                }
            },
            None => FallbackGenerator::artifact(request),
        }
    }

    async fn handle_generation(&self, request: &TestGenerationRequest) -> Result<()> {
        let artifact = self.produce(request).await;
        let path = self.artifact_path(request);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create tests dir {}", parent.display()))?;
        }
        tokio::fs::write(&path, &artifact.content)
            .await
            .with_context(|| format!("failed to write artifact {}", path.display()))?;

        self.db
            .insert_test_artifact(
                &artifact.title,
                &path.to_string_lossy(),
                artifact.provider,
                serde_json::json!({
                    "repo": request.repo,
                    "branch": request.branch,
                    "head_commit": request.head_commit,
                    "changed_files": request.changed_files,
                }),
            )
            .await
            .context("failed to persist artifact metadata")?;

        info!(
            title = %artifact.title,
            path = %path.display(),
            provider = %artifact.provider,
            "test artifact written"
        );
        self.events.publish(Event::TestGenerated {
            title: artifact.title.clone(),
            file_path: path.to_string_lossy().to_string(),
            provider: artifact.provider.to_string(),
        });

        // Kick off a broad execution over the tests directory.
        self.bus
            .send(Message::new(
                self.identity.clone(),
                AgentType::Executor,
                MessagePayload::ExecutionRequest(ExecutionRequest::default()),
            ))
            .await
            .context("failed to enqueue execution request")?;

        Ok(())
    }
}

#[async_trait]
impl Agent for WriterAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Writer
    }

    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.message.payload {
            MessagePayload::TestGenerationRequest(request) => self.handle_generation(request).await,
            other => bail!("writer cannot handle {}", other.kind()),
        }
    }
}
