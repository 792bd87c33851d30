//! Consumer/router: pulls from the bus in priority order and dispatches to
//! the registered agent hosts under a concurrency ceiling.
//!
//! The loop never pops when at the ceiling, so backpressure accumulates in
//! the bus. Shutdown stops accepting new messages and drains in-flight
//! handlers within a bounded budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::PriorityBus;
use crate::config::WorkerConfig;
use crate::message::AgentType;
use crate::runtime::AgentHost;

/// Routes deliveries to agent hosts by target type.
pub struct Router {
    bus: Arc<PriorityBus>,
    agents: HashMap<AgentType, Arc<AgentHost>>,
    config: WorkerConfig,
}

impl Router {
    pub fn new(bus: Arc<PriorityBus>, config: WorkerConfig) -> Self {
        Self {
            bus,
            agents: HashMap::new(),
            config,
        }
    }

    /// Register a host for its agent type. The last registration for a
    /// type wins.
    pub fn register(&mut self, host: Arc<AgentHost>) {
        self.agents.insert(host.agent_type(), host);
    }

    pub fn agent(&self, agent_type: AgentType) -> Option<&Arc<AgentHost>> {
        self.agents.get(&agent_type)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<AgentHost>> {
        self.agents.values()
    }

    /// Initialize every registered host.
    pub async fn initialize_all(&self) -> Result<()> {
        for host in self.agents.values() {
            host.initialize().await?;
        }
        Ok(())
    }

    /// Shut down every registered host, logging (not propagating) errors.
    pub async fn shutdown_all(&self) {
        for host in self.agents.values() {
            if let Err(e) = host.shutdown().await {
                warn!(agent = %host.identity(), error = %format!("{e:#}"), "agent shutdown failed");
            }
        }
    }

    /// Run the consume loop until `cancel` fires, then drain in-flight
    /// handlers within the drain budget.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (tx, mut rx) = mpsc::channel::<()>(self.config.max_concurrency * 2);
        let mut in_flight: usize = 0;

        loop {
            // Shutdown: stop popping and drain what is already running.
            if cancel.is_cancelled() {
                info!(in_flight, "router cancelled, draining in-flight handlers");
                let drain_deadline = tokio::time::Instant::now() + self.config.drain_budget;
                while in_flight > 0 {
                    match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                        Ok(Some(())) => in_flight -= 1,
                        _ => break,
                    }
                }
                if in_flight > 0 {
                    warn!(
                        remaining = in_flight,
                        "drain budget expired with handlers still in flight"
                    );
                }
                return Ok(());
            }

            // Collect completions without blocking.
            while rx.try_recv().is_ok() {
                in_flight -= 1;
            }

            // At the ceiling: wait for a completion instead of popping.
            if in_flight >= self.config.max_concurrency {
                tokio::select! {
                    done = rx.recv() => {
                        if done.is_some() {
                            in_flight -= 1;
                        }
                    }
                    _ = cancel.cancelled() => continue,
                }
                continue;
            }

            let delivery = tokio::select! {
                popped = self.bus.consume_next(self.config.poll_timeout) => popped?,
                _ = cancel.cancelled() => continue,
            };
            let Some(delivery) = delivery else {
                continue;
            };

            let resolved = delivery.message.target.resolve();
            let host = resolved.and_then(|t| self.agents.get(&t));
            let Some(host) = host else {
                warn!(
                    target = %delivery.message.target.agent_type,
                    message_id = %delivery.message.id,
                    "no agent registered for target, failing message"
                );
                if let Err(e) = self
                    .bus
                    .fail_with_reason(&delivery.message, Some("no-agent"))
                    .await
                {
                    warn!(error = %e, "failed to fail unroutable message");
                }
                continue;
            };

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            in_flight += 1;

            let host = Arc::clone(host);
            let tx = tx.clone();
            tokio::spawn(async move {
                host.handle(delivery).await;
                drop(permit);
                let _ = tx.send(()).await;
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::store::MemoryStore;
    use crate::bus::BusConfig;
    use crate::config::RuntimeConfig;
    use crate::events::EventChannel;
    use crate::message::{AgentIdentity, Message, MessagePayload};
    use crate::runtime::Agent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Probe {
        agent_type: AgentType,
        handled: AtomicU64,
    }

    #[async_trait]
    impl Agent for Probe {
        fn agent_type(&self) -> AgentType {
            self.agent_type
        }

        async fn on_message(&self, _delivery: &crate::bus::Delivery) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn quick_worker_config() -> WorkerConfig {
        WorkerConfig {
            max_concurrency: 4,
            poll_timeout: Duration::from_millis(20),
            drain_budget: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn routes_by_normalized_target() {
        let bus = Arc::new(PriorityBus::new(
            Arc::new(MemoryStore::new()),
            BusConfig {
                retry_delay: Duration::ZERO,
                ..BusConfig::default()
            },
        ));
        let events = EventChannel::default();
        let probe = Arc::new(Probe {
            agent_type: AgentType::Logger,
            handled: AtomicU64::new(0),
        });
        let host = Arc::new(AgentHost::new(
            Arc::clone(&probe) as Arc<dyn Agent>,
            Arc::clone(&bus),
            events,
            RuntimeConfig::default(),
        ));
        host.initialize().await.unwrap();

        let mut router = Router::new(Arc::clone(&bus), quick_worker_config());
        router.register(host);

        // Target written with the `<name>agent` alias and mixed case.
        let mut msg = Message::new(
            AgentIdentity::local(AgentType::Writer),
            AgentType::Logger,
            MessagePayload::OptimizeRecent {},
        );
        msg.target.agent_type = "Logger-Agent".to_string();
        bus.send(msg).await.unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });
        router.run(cancel).await.unwrap();

        assert_eq!(probe.handled.load(Ordering::SeqCst), 1);
    }
}
