//! The `proctor work` command: run the router and the agent fleet without
//! the HTTP ingress.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::ProctorConfig;
use crate::wiring::{Fleet, build_fleet, select_database};

pub async fn run_work(config: &ProctorConfig, memory_db: bool) -> Result<()> {
    let db = select_database(config, memory_db).await?;
    let Fleet { router, .. } = build_fleet(&config.core, db);

    router.initialize_all().await?;
    tracing::info!(
        max_concurrency = config.core.worker.max_concurrency,
        "worker started"
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let result = router.run(cancel).await;
    router.shutdown_all().await;
    tracing::info!("worker stopped");
    result
}
