//! The test-generation collaborator.
//!
//! The writer agent asks a [`Generator`] to turn change metadata into a
//! test artifact. The shipped [`FallbackGenerator`] is deterministic: the
//! same request always yields the same artifact, so re-delivered generation
//! requests are harmless. A model-backed generator plugs in behind the same
//! trait; whenever it errors, the writer falls back to the deterministic
//! artifact.

use anyhow::Result;
use async_trait::async_trait;

use proctor_db::models::ArtifactProvider;

use crate::message::TestGenerationRequest;

/// Token usage reported by a model-backed generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A produced test artifact. The content is opaque to the core.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    pub title: String,
    pub content: String,
    pub provider: ArtifactProvider,
    pub usage: Option<GeneratorUsage>,
}

/// External artifact producer.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &TestGenerationRequest) -> Result<GeneratedArtifact>;
}

// Compile-time assertion: Generator must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Generator) {}
};

/// Deterministic generator used when no model is configured or the model
/// call fails.
#[derive(Debug, Default, Clone)]
pub struct FallbackGenerator;

impl FallbackGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Build the fallback artifact synchronously. Exposed so the writer can
    /// use it directly after a model failure without a second await.
    pub fn artifact(request: &TestGenerationRequest) -> GeneratedArtifact {
        let short_commit: String = request.head_commit.chars().take(8).collect();
        let title = format!("Smoke test for {}@{}", request.repo, short_commit);

        let mut content = String::new();
        content.push_str("import { test, expect } from '@playwright/test';\n\n");
        content.push_str(&format!(
            "// Generated for {} ({}, commit {})\n",
            request.repo, request.branch, short_commit
        ));
        if !request.changed_files.is_empty() {
            content.push_str("// Changed files:\n");
            for file in &request.changed_files {
                content.push_str(&format!("//   - {file}\n"));
            }
        }
        content.push('\n');
        content.push_str(&format!(
            "test('{title}', async ({{ page }}) => {{\n  await page.goto('/');\n  await expect(page.getByRole('banner')).toBeVisible();\n}});\n"
        ));

        GeneratedArtifact {
            title,
            content,
            provider: ArtifactProvider::Fallback,
            usage: None,
        }
    }
}

#[async_trait]
impl Generator for FallbackGenerator {
    async fn generate(&self, request: &TestGenerationRequest) -> Result<GeneratedArtifact> {
        Ok(Self::artifact(request))
    }
}
