//! Fire-and-forget broadcast of lifecycle and domain events.
//!
//! Publishing never fails and never blocks: with no subscribers the event is
//! simply dropped. Subscribers that fall behind lose the oldest events
//! (broadcast channel semantics), which is acceptable for an observability
//! side channel.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::message::{AgentIdentity, RunStatus};

/// Lifecycle and domain events broadcast by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum Event {
    AgentStarted {
        agent: AgentIdentity,
    },
    AgentStopped {
        agent: AgentIdentity,
    },
    AgentError {
        agent: String,
        message: String,
    },
    CircuitOpened {
        agent: String,
        failure_rate: f64,
    },
    TestGenerated {
        title: String,
        file_path: String,
        provider: String,
    },
    ExecutionCompleted {
        execution_id: String,
        status: RunStatus,
        summary: String,
    },
    ReportGenerated {
        execution_id: String,
        file_path: String,
    },
    LocatorSynthesisCompleted {
        top: Option<String>,
        candidate_count: usize,
    },
    LogQueryCompleted {
        matched: usize,
    },
}

impl Event {
    /// The dotted event name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentStarted { .. } => "agent.lifecycle.started",
            Self::AgentStopped { .. } => "agent.lifecycle.stopped",
            Self::AgentError { .. } => "agent.error",
            Self::CircuitOpened { .. } => "agent.circuit.opened",
            Self::TestGenerated { .. } => "test.generated",
            Self::ExecutionCompleted { .. } => "execution.completed",
            Self::ReportGenerated { .. } => "report.generated",
            Self::LocatorSynthesisCompleted { .. } => "locator.synthesis.completed",
            Self::LogQueryCompleted { .. } => "logs.query.completed",
        }
    }
}

/// Broadcast channel handle. Cheap to clone; all clones share the channel.
#[derive(Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<Event>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Returns the number of
    /// subscribers that received it.
    pub fn publish(&self, event: Event) -> usize {
        tracing::debug!(event = event.name(), "publishing event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Open a new subscription. Only events published after this call are
    /// received.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(256)
    }
}
