//! Message envelope and payload types for the priority bus.
//!
//! Every unit of inter-agent work travels as a [`Message`]: an envelope with
//! identity, routing, and priority metadata wrapped around a kind-specific
//! payload. The payload is a sum type tagged by `kind` on the wire so that
//! routing and auditing can read the kind without knowing the payload shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::selector::ElementDescriptor;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Delivery priority class. Routes the message to one of the three priority
/// queues; anything that is not high or critical lands on the default queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Agent addressing
// ---------------------------------------------------------------------------

/// The seven agent types addressable on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Writer,
    Executor,
    Optimizer,
    Locator,
    Reporter,
    Context,
    Logger,
}

impl AgentType {
    /// Resolve a raw `target.type` string into an agent type.
    ///
    /// Normalization: lowercase, strip non-alphanumeric characters, and
    /// accept a trailing `agent` alias (`"Executor-Agent"` resolves to
    /// [`AgentType::Executor`]). Returns `None` for anything unknown.
    pub fn resolve(raw: &str) -> Option<Self> {
        let mut normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        if let Some(stripped) = normalized.strip_suffix("agent") {
            // "agent" alone is not an alias for anything.
            if !stripped.is_empty() {
                normalized = stripped.to_string();
            }
        }
        normalized.parse().ok()
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Writer => "writer",
            Self::Executor => "executor",
            Self::Optimizer => "optimizer",
            Self::Locator => "locator",
            Self::Reporter => "reporter",
            Self::Context => "context",
            Self::Logger => "logger",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentType {
    type Err = AgentTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "writer" => Ok(Self::Writer),
            "executor" => Ok(Self::Executor),
            "optimizer" => Ok(Self::Optimizer),
            "locator" => Ok(Self::Locator),
            "reporter" => Ok(Self::Reporter),
            "context" => Ok(Self::Context),
            "logger" => Ok(Self::Logger),
            other => Err(AgentTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentType`] string.
#[derive(Debug, Clone)]
pub struct AgentTypeParseError(pub String);

impl fmt::Display for AgentTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent type: {:?}", self.0)
    }
}

impl std::error::Error for AgentTypeParseError {}

/// Identity of a message sender: agent type plus instance and node labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub instance: String,
    pub node: String,
}

impl AgentIdentity {
    /// Build a local identity with a per-process instance suffix.
    pub fn local(agent_type: AgentType) -> Self {
        let node = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            instance: format!("{agent_type}-{}", &Uuid::new_v4().simple().to_string()[..8]),
            agent_type,
            node,
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance, self.node)
    }
}

/// The routing target of a message. Kept as a raw string so that an unknown
/// or misspelled target survives deserialization and can be dead-lettered
/// with its original value instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub agent_type: String,
}

impl Target {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type: agent_type.to_string(),
        }
    }

    /// Resolve this target to a known agent type, if any.
    pub fn resolve(&self) -> Option<AgentType> {
        AgentType::resolve(&self.agent_type)
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Outcome of one test run as reported on the bus. `Skipped` marks a run
/// that observed a cancellation before or during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A repository change event that should produce a new test artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestGenerationRequest {
    pub repo: String,
    pub branch: String,
    pub head_commit: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub compare_url: Option<String>,
}

/// A request to run tests. All fields are optional: an empty request means a
/// broad run over the configured tests directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub test_file_path: Option<String>,
    #[serde(default)]
    pub grep: Option<String>,
    #[serde(default)]
    pub rerun_attempt: Option<u32>,
    /// Set when the optimizer re-runs a file after rewriting a locator.
    #[serde(default)]
    pub optimization_rerun: bool,
}

/// A single failing test extracted from an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedTest {
    pub file: String,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default)]
    pub selector_guess: Option<String>,
    #[serde(default)]
    pub error_snippet: Option<String>,
}

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: RunStatus,
    pub summary: String,
    #[serde(default)]
    pub failed_tests: Option<Vec<FailedTest>>,
}

/// A request to rewrite a locator in a failing test file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeTestFile {
    pub execution_id: String,
    pub test_file_path: String,
    #[serde(default)]
    pub original_selector: Option<String>,
    #[serde(default)]
    pub rerun_attempt: Option<u32>,
}

/// Correlation data threaded through a locator synthesis round trip so that
/// the optimizer can match responses to its pending state and discard stale
/// ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationContext {
    pub execution_id: String,
    pub test_file_path: String,
    pub original_selector: String,
    pub attempt_number: u64,
}

/// Opaque context echoed by the locator agent in its response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocatorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_context: Option<OptimizationContext>,
}

/// A request to synthesize and rank candidate selectors for an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorSynthesisRequest {
    pub request_id: Uuid,
    pub element: ElementDescriptor,
    #[serde(default)]
    pub context: LocatorContext,
}

/// A selector with its computed ranking score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredSelector {
    pub selector: String,
    pub score: i64,
}

/// Ranked candidate selectors answering a [`LocatorSynthesisRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorCandidates {
    #[serde(default)]
    pub context: LocatorContext,
    pub candidates: Vec<ScoredSelector>,
}

/// A structured log record to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntryPayload {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// The payload sum type
// ---------------------------------------------------------------------------

/// Kind-tagged message payload. The serialized form carries
/// `{"kind": "...", "payload": {...}}` inside the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    TestGenerationRequest(TestGenerationRequest),
    ExecutionRequest(ExecutionRequest),
    ExecutionCancel {
        execution_id: String,
    },
    ExecutionResult(ExecutionResult),
    ExecutionFailure {
        execution_id: String,
        summary: String,
    },
    GenerateReport {
        execution_id: String,
    },
    OptimizeRecent {},
    OptimizeTestFile(OptimizeTestFile),
    LocatorSynthesisRequest(LocatorSynthesisRequest),
    LocatorCandidates(LocatorCandidates),
    UpdateContext {
        key: String,
        value: serde_json::Value,
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    GetContext {
        key: String,
    },
    LogEntry(LogEntryPayload),
    QueryLogs {
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        limit: Option<i64>,
    },
}

impl MessagePayload {
    /// The wire name of this payload's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TestGenerationRequest(_) => "TEST_GENERATION_REQUEST",
            Self::ExecutionRequest(_) => "EXECUTION_REQUEST",
            Self::ExecutionCancel { .. } => "EXECUTION_CANCEL",
            Self::ExecutionResult(_) => "EXECUTION_RESULT",
            Self::ExecutionFailure { .. } => "EXECUTION_FAILURE",
            Self::GenerateReport { .. } => "GENERATE_REPORT",
            Self::OptimizeRecent {} => "OPTIMIZE_RECENT",
            Self::OptimizeTestFile(_) => "OPTIMIZE_TEST_FILE",
            Self::LocatorSynthesisRequest(_) => "LOCATOR_SYNTHESIS_REQUEST",
            Self::LocatorCandidates(_) => "LOCATOR_CANDIDATES",
            Self::UpdateContext { .. } => "UPDATE_CONTEXT",
            Self::GetContext { .. } => "GET_CONTEXT",
            Self::LogEntry(_) => "LOG_ENTRY",
            Self::QueryLogs { .. } => "QUERY_LOGS",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The message envelope placed on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub source: AgentIdentity,
    pub target: Target,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: MessagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Milliseconds since the epoch, stamped by the bus at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<i64>,
}

impl Message {
    /// Build a message with a fresh id, the current timestamp, and normal
    /// priority.
    pub fn new(source: AgentIdentity, target: AgentType, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            target: Target::new(target),
            priority: Priority::Normal,
            timestamp: Utc::now(),
            payload,
            idempotency_key: None,
            enqueued_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// The wire name of this message's kind.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message::new(
            AgentIdentity::local(AgentType::Executor),
            AgentType::Optimizer,
            MessagePayload::ExecutionResult(ExecutionResult {
                execution_id: "exec-1".to_string(),
                status: RunStatus::Failed,
                summary: "1 failed".to_string(),
                failed_tests: None,
            }),
        )
    }

    #[test]
    fn envelope_json_roundtrip() {
        let msg = sample_message().with_idempotency_key("k-1");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn kind_tag_appears_on_the_wire() {
        let msg = sample_message();
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "EXECUTION_RESULT");
        assert_eq!(value["payload"]["execution_id"], "exec-1");
        assert_eq!(value["target"]["type"], "optimizer");
    }

    #[test]
    fn priority_defaults_to_normal() {
        // A message serialized without a priority field parses as normal.
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "source": {"type": "writer", "instance": "writer-1", "node": "n1"},
            "target": {"type": "executor"},
            "timestamp": Utc::now(),
            "kind": "EXECUTION_REQUEST",
            "payload": {}
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.priority, Priority::Normal);
        assert!(matches!(
            msg.payload,
            MessagePayload::ExecutionRequest(ExecutionRequest {
                execution_id: None,
                ..
            })
        ));
    }

    #[test]
    fn resolve_normalizes_target_strings() {
        assert_eq!(AgentType::resolve("executor"), Some(AgentType::Executor));
        assert_eq!(AgentType::resolve("ExecutorAgent"), Some(AgentType::Executor));
        assert_eq!(AgentType::resolve("executor-agent"), Some(AgentType::Executor));
        assert_eq!(AgentType::resolve("OPTIMIZER"), Some(AgentType::Optimizer));
        assert_eq!(AgentType::resolve("Locator_Agent"), Some(AgentType::Locator));
        assert_eq!(AgentType::resolve("frontend"), None);
        assert_eq!(AgentType::resolve(""), None);
        // "agent" alone does not alias to anything.
        assert_eq!(AgentType::resolve("agent"), None);
    }

    #[test]
    fn unknown_target_survives_deserialization() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "source": {"type": "writer", "instance": "writer-1", "node": "n1"},
            "target": {"type": "no-such-agent"},
            "timestamp": Utc::now(),
            "kind": "OPTIMIZE_RECENT",
            "payload": {}
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.target.agent_type, "no-such-agent");
        assert_eq!(msg.target.resolve(), None);
    }

    #[test]
    fn agent_type_display_roundtrip() {
        let variants = [
            AgentType::Writer,
            AgentType::Executor,
            AgentType::Optimizer,
            AgentType::Locator,
            AgentType::Reporter,
            AgentType::Context,
            AgentType::Logger,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }
}
