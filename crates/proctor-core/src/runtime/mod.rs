//! The agent runtime: one typed handler hosted with lifecycle, health,
//! metrics, and fault isolation.
//!
//! [`AgentHost`] wraps an [`Agent`] implementation and mediates every
//! message: the circuit breaker gates dispatch, successes acknowledge the
//! message, failures hand it back to the bus for retry. Handler errors
//! never escape the host.

pub mod breaker;
pub mod health;
pub mod metrics;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{Delivery, PriorityBus};
use crate::config::RuntimeConfig;
use crate::events::{Event, EventChannel};
use crate::message::{AgentIdentity, AgentType};
use breaker::{BreakerConfig, CircuitBreaker};
use health::{HealthStatus, HealthTracker, HealthVerdict};
use metrics::{AgentMetrics, AgentMetricsSnapshot};

// ---------------------------------------------------------------------------
// Agent trait
// ---------------------------------------------------------------------------

/// A typed message handler hosted by [`AgentHost`].
///
/// Implementations hold their collaborators (bus, events, shared state,
/// database) as injected `Arc` fields and communicate with other agents
/// only through messages and shared state.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The agent type this handler serves; used for routing.
    fn agent_type(&self) -> AgentType;

    /// Agent-specific startup work. Runs inside the startup budget.
    async fn on_initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Handle one delivered message. An `Err` marks the delivery failed and
    /// sends it back to the bus for retry.
    async fn on_message(&self, delivery: &Delivery) -> Result<()>;

    /// Agent-specific teardown. Runs inside the shutdown budget.
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Agent-specific health probe, combined with the bus probe each tick.
    async fn probe(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

// Compile-time assertion: Agent must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};

// ---------------------------------------------------------------------------
// Agent status
// ---------------------------------------------------------------------------

/// Lifecycle status of a hosted agent. `Offline` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Uninitialized,
    Initializing,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl AgentStatus {
    /// Whether `from -> to` is an edge in the status graph.
    ///
    /// ```text
    /// uninitialized -> initializing
    /// initializing  -> healthy
    /// healthy <-> degraded <-> unhealthy (any pair)
    /// any -> offline
    /// ```
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        if to == Self::Offline {
            return true;
        }
        matches!(
            (from, to),
            (Self::Uninitialized, Self::Initializing)
                | (Self::Initializing, Self::Healthy)
                | (Self::Healthy, Self::Degraded)
                | (Self::Healthy, Self::Unhealthy)
                | (Self::Degraded, Self::Healthy)
                | (Self::Degraded, Self::Unhealthy)
                | (Self::Unhealthy, Self::Healthy)
                | (Self::Unhealthy, Self::Degraded)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

fn demoted_status(probe: HealthStatus) -> AgentStatus {
    match probe {
        HealthStatus::Healthy => AgentStatus::Healthy,
        HealthStatus::Degraded => AgentStatus::Degraded,
        // A dead dependency makes the agent unhealthy, not offline;
        // offline is reserved for deliberate shutdown.
        HealthStatus::Unhealthy | HealthStatus::Offline => AgentStatus::Unhealthy,
    }
}

// ---------------------------------------------------------------------------
// AgentHost
// ---------------------------------------------------------------------------

/// Hosts one agent: status machine, health tick, circuit breaker, metrics,
/// and the dispatch/acknowledge/fail contract.
pub struct AgentHost {
    agent: Arc<dyn Agent>,
    identity: AgentIdentity,
    bus: Arc<PriorityBus>,
    events: EventChannel,
    config: RuntimeConfig,
    status: Mutex<AgentStatus>,
    breaker: CircuitBreaker,
    metrics: AgentMetrics,
    init: tokio::sync::OnceCell<()>,
    health_cancel: CancellationToken,
}

impl AgentHost {
    pub fn new(
        agent: Arc<dyn Agent>,
        bus: Arc<PriorityBus>,
        events: EventChannel,
        config: RuntimeConfig,
    ) -> Self {
        let identity = AgentIdentity::local(agent.agent_type());
        let breaker = CircuitBreaker::new(BreakerConfig {
            min_processed: config.breaker_min_processed,
            failure_rate: config.breaker_failure_rate,
            cooldown: config.breaker_cooldown,
        });
        Self {
            agent,
            identity,
            bus,
            events,
            config,
            status: Mutex::new(AgentStatus::Uninitialized),
            breaker,
            metrics: AgentMetrics::default(),
            init: tokio::sync::OnceCell::new(),
            health_cancel: CancellationToken::new(),
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent.agent_type()
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn status(&self) -> AgentStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(AgentStatus::Offline)
    }

    fn set_status(&self, to: AgentStatus) {
        if let Ok(mut status) = self.status.lock() {
            if *status != to {
                self.metrics.record_lifecycle(format!("status: {} -> {to}", *status));
                *status = to;
            }
        }
    }

    pub fn metrics(&self) -> AgentMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Open dependencies and start the health tick. Idempotent; concurrent
    /// calls coalesce onto one initialization. Fails if the startup budget
    /// is exceeded.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let host = Arc::clone(self);
        self.init
            .get_or_try_init(|| async move {
                host.set_status(AgentStatus::Initializing);

                let startup = async {
                    // Dependencies first, then the agent's own hook.
                    host.bus.ping().await.context("bus probe failed")?;
                    host.agent.on_initialize().await
                };
                tokio::time::timeout(host.config.startup_budget, startup)
                    .await
                    .map_err(|_| {
                        anyhow::anyhow!(
                            "agent {} exceeded startup budget of {:?}",
                            host.identity,
                            host.config.startup_budget
                        )
                    })??;

                host.spawn_health_tick();
                host.set_status(AgentStatus::Healthy);
                host.metrics.record_lifecycle("started");
                host.events.publish(Event::AgentStarted {
                    agent: host.identity.clone(),
                });
                info!(agent = %host.identity, "agent initialized");
                Ok::<(), anyhow::Error>(())
            })
            .await
            .map(|_| ())
    }

    fn spawn_health_tick(self: &Arc<Self>) {
        let host = Arc::clone(self);
        let cancel = self.health_cancel.clone();
        tokio::spawn(async move {
            let mut tracker = HealthTracker::default();
            let mut interval = tokio::time::interval(host.config.health_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the probe cadence
            // starts one interval after startup.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let bus_probe = match host.bus.ping().await {
                    Ok(()) => HealthStatus::Healthy,
                    Err(_) => HealthStatus::Unhealthy,
                };
                let agent_probe = host.agent.probe().await;
                let aggregate = HealthStatus::aggregate([bus_probe, agent_probe]);

                match tracker.observe(
                    aggregate,
                    host.config.failure_threshold,
                    host.config.recovery_threshold,
                ) {
                    HealthVerdict::Hold => {}
                    HealthVerdict::Demote(worst) => {
                        let to = demoted_status(worst);
                        warn!(agent = %host.identity, status = %to, "health degraded");
                        host.set_status(to);
                    }
                    HealthVerdict::Recover => {
                        if host.status() != AgentStatus::Healthy
                            && host.status() != AgentStatus::Offline
                        {
                            info!(agent = %host.identity, "health recovered");
                            host.set_status(AgentStatus::Healthy);
                        }
                    }
                }
            }
        });
    }

    /// Stop the health tick, run the agent's teardown, and go offline.
    pub async fn shutdown(&self) -> Result<()> {
        self.set_status(AgentStatus::Offline);
        self.health_cancel.cancel();

        tokio::time::timeout(self.config.shutdown_budget, self.agent.on_shutdown())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "agent {} exceeded shutdown budget of {:?}",
                    self.identity,
                    self.config.shutdown_budget
                )
            })??;

        self.metrics.record_lifecycle("stopped");
        self.events.publish(Event::AgentStopped {
            agent: self.identity.clone(),
        });
        Ok(())
    }

    /// Dispatch one delivery to the agent.
    ///
    /// With the breaker open (or the host offline) the message is skipped
    /// without acknowledgement: its processing lease expires and the
    /// message is eventually redelivered. On success the message is
    /// acknowledged; on handler failure it is handed back via `bus.fail`.
    /// Errors never propagate out of this method.
    pub async fn handle(&self, delivery: Delivery) {
        let id = delivery.message.id;
        let kind = delivery.message.kind();

        if self.status() == AgentStatus::Offline {
            warn!(agent = %self.identity, message_id = %id, "agent offline, skipping dispatch");
            return;
        }
        if self.breaker.is_open() {
            warn!(
                agent = %self.identity,
                message_id = %id,
                "circuit breaker open, leaving message unacknowledged"
            );
            self.metrics.record_lifecycle("breaker-skip");
            return;
        }

        let started = Instant::now();
        match self.agent.on_message(&delivery).await {
            Ok(()) => {
                let elapsed = started.elapsed().as_millis() as u64;
                if let Err(e) = self.bus.acknowledge(id).await {
                    warn!(agent = %self.identity, message_id = %id, error = %e, "acknowledge failed");
                }
                self.metrics.record_success(elapsed);
                self.breaker.record_success();
            }
            Err(e) => {
                error!(
                    agent = %self.identity,
                    message_id = %id,
                    kind,
                    error = %format!("{e:#}"),
                    "handler failed"
                );
                self.metrics.record_failure(&format!("{e:#}"));
                self.events.publish(Event::AgentError {
                    agent: self.identity.to_string(),
                    message: format!("{e:#}"),
                });
                if self.breaker.record_failure() {
                    let rate = self.breaker.failure_rate();
                    warn!(agent = %self.identity, failure_rate = rate, "circuit breaker opened");
                    self.metrics.record_lifecycle("breaker-opened");
                    self.events.publish(Event::CircuitOpened {
                        agent: self.identity.to_string(),
                        failure_rate: rate,
                    });
                }
                if let Err(bus_err) = self.bus.fail(&delivery.message).await {
                    warn!(agent = %self.identity, message_id = %id, error = %bus_err, "bus.fail failed");
                }
            }
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
    use crate::message::{Message, MessagePayload};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Counts handled messages; fails while `failing` is set.
    struct CountingAgent {
        handled: AtomicU64,
        failing: std::sync::atomic::AtomicBool,
    }

    impl CountingAgent {
        fn new(failing: bool) -> Self {
            Self {
                handled: AtomicU64::new(0),
                failing: std::sync::atomic::AtomicBool::new(failing),
            }
        }
    }

    #[async_trait]
    impl Agent for CountingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Logger
        }

        async fn on_message(&self, _delivery: &Delivery) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("induced failure");
            }
            Ok(())
        }
    }

    fn host_with(agent: Arc<CountingAgent>) -> (Arc<AgentHost>, Arc<PriorityBus>) {
        let bus = Arc::new(PriorityBus::new(
            Arc::new(MemoryStore::new()),
            BusConfig {
                retry_delay: Duration::ZERO,
                ..BusConfig::default()
            },
        ));
        let host = Arc::new(AgentHost::new(
            agent,
            Arc::clone(&bus),
            EventChannel::default(),
            RuntimeConfig::default(),
        ));
        (host, bus)
    }

    async fn deliver_one(bus: &PriorityBus, host: &AgentHost) {
        bus.send(Message::new(
            AgentIdentity::local(AgentType::Writer),
            AgentType::Logger,
            MessagePayload::OptimizeRecent {},
        ))
        .await
        .unwrap();
        let delivery = bus
            .consume_next(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        host.handle(delivery).await;
    }

    #[test]
    fn status_transition_graph() {
        use AgentStatus::*;
        assert!(AgentStatus::is_valid_transition(Uninitialized, Initializing));
        assert!(AgentStatus::is_valid_transition(Initializing, Healthy));
        assert!(AgentStatus::is_valid_transition(Healthy, Degraded));
        assert!(AgentStatus::is_valid_transition(Degraded, Unhealthy));
        assert!(AgentStatus::is_valid_transition(Unhealthy, Healthy));
        assert!(AgentStatus::is_valid_transition(Healthy, Offline));
        assert!(!AgentStatus::is_valid_transition(Uninitialized, Healthy));
        assert!(!AgentStatus::is_valid_transition(Offline, Healthy));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (host, _bus) = host_with(Arc::new(CountingAgent::new(false)));
        host.initialize().await.unwrap();
        host.initialize().await.unwrap();
        assert_eq!(host.status(), AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn successful_handling_acknowledges_and_counts() {
        let agent = Arc::new(CountingAgent::new(false));
        let (host, bus) = host_with(Arc::clone(&agent));
        host.initialize().await.unwrap();

        deliver_one(&bus, &host).await;

        assert_eq!(agent.handled.load(Ordering::SeqCst), 1);
        let snap = host.metrics();
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.acked, 1);
        assert_eq!(snap.failed, 0);
    }

    #[tokio::test]
    async fn breaker_opens_after_failure_streak_and_suppresses_dispatch() {
        let agent = Arc::new(CountingAgent::new(true));
        let (host, bus) = host_with(Arc::clone(&agent));
        host.initialize().await.unwrap();

        // 11 failures: breaker opens within one message of crossing the
        // (processed > 10, rate > 0.5) threshold.
        for _ in 0..11 {
            deliver_one(&bus, &host).await;
        }
        assert_eq!(agent.handled.load(Ordering::SeqCst), 11);

        // Next delivery is suppressed without reaching the agent.
        deliver_one(&bus, &host).await;
        assert_eq!(agent.handled.load(Ordering::SeqCst), 11);

        let snap = host.metrics();
        assert!(snap.lifecycle.iter().any(|e| e.what == "breaker-opened"));
        assert!(snap.lifecycle.iter().any(|e| e.what == "breaker-skip"));
    }

    #[tokio::test]
    async fn shutdown_goes_offline_and_stops_dispatch() {
        let agent = Arc::new(CountingAgent::new(false));
        let (host, bus) = host_with(Arc::clone(&agent));
        host.initialize().await.unwrap();
        host.shutdown().await.unwrap();
        assert_eq!(host.status(), AgentStatus::Offline);

        deliver_one(&bus, &host).await;
        assert_eq!(agent.handled.load(Ordering::SeqCst), 0);
    }
}
