//! Construction of the in-process fleet: store, bus, events, shared state,
//! database collaborator, agents, hosts, and router.

use std::sync::Arc;

use anyhow::Result;

use proctor_core::agents::{
    ContextAgent, ExecutorAgent, LocatorAgent, LoggerAgent, OptimizerAgent, ReporterAgent,
    WriterAgent,
};
use proctor_core::bus::PriorityBus;
use proctor_core::bus::store::{MemoryStore, QueueStore};
use proctor_core::config::CoreConfig;
use proctor_core::db::{Database, MemoryDatabase, PgDatabase};
use proctor_core::events::EventChannel;
use proctor_core::router::Router;
use proctor_core::runner::ProcessRunner;
use proctor_core::runtime::{Agent, AgentHost};
use proctor_core::state::SharedState;

use crate::config::ProctorConfig;

/// Everything a worker process needs, fully wired.
pub struct Fleet {
    pub bus: Arc<PriorityBus>,
    pub events: EventChannel,
    pub db: Arc<dyn Database>,
    pub router: Router,
}

/// Pick the database collaborator: PostgreSQL unless `--memory-db` was
/// given.
pub async fn select_database(
    config: &ProctorConfig,
    memory_db: bool,
) -> Result<Arc<dyn Database>> {
    if memory_db {
        tracing::info!("using in-memory database collaborator");
        return Ok(Arc::new(MemoryDatabase::new()));
    }
    let pool = proctor_db::pool::connect(&config.db_config).await?;
    Ok(Arc::new(PgDatabase::new(pool)))
}

/// Build the full agent fleet over an in-process store.
pub fn build_fleet(core: &CoreConfig, db: Arc<dyn Database>) -> Fleet {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
    let bus = Arc::new(PriorityBus::new(Arc::clone(&store), core.bus.clone()));
    let state = SharedState::new(store, core.state.clone());
    let events = EventChannel::default();

    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(WriterAgent::new(
            Arc::clone(&bus),
            events.clone(),
            Arc::clone(&db),
            None,
            core.executor.tests_dir.clone(),
        )),
        Arc::new(ExecutorAgent::new(
            Arc::clone(&bus),
            events.clone(),
            Arc::clone(&db),
            Arc::new(ProcessRunner::new()),
            core.executor.clone(),
        )),
        Arc::new(OptimizerAgent::new(
            Arc::clone(&bus),
            state.clone(),
            Arc::clone(&db),
            core.optimizer.clone(),
        )),
        Arc::new(LocatorAgent::new(
            Arc::clone(&bus),
            events.clone(),
            core.locator.clone(),
        )),
        Arc::new(ReporterAgent::new(
            events.clone(),
            Arc::clone(&db),
            core.executor.report_dir.clone(),
        )),
        Arc::new(ContextAgent::new(Arc::clone(&bus), state.clone())),
        Arc::new(LoggerAgent::new(
            events.clone(),
            Arc::clone(&db),
            core.logger.clone(),
        )),
    ];

    let mut router = Router::new(Arc::clone(&bus), core.worker.clone());
    for agent in agents {
        router.register(Arc::new(AgentHost::new(
            agent,
            Arc::clone(&bus),
            events.clone(),
            core.runtime.clone(),
        )));
    }

    Fleet {
        bus,
        events,
        db,
        router,
    }
}
