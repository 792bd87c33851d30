//! Shared test utilities for proctor integration tests.
//!
//! One PostgreSQL instance is shared per test binary; each test claims a
//! [`TestDb`] — a uniquely named, fully migrated database — and tears it
//! down when done.
//!
//! The instance comes from `PROCTOR_TEST_PG_URL` when set (a CI setup
//! script pointing at an external server), otherwise a container is
//! started once via testcontainers and kept alive for the binary's
//! lifetime.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use proctor_db::pool::MIGRATOR;

struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external
    /// server.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

/// Base URL of the shared PostgreSQL server (no database name appended).
/// Lazily starts a container on first call unless `PROCTOR_TEST_PG_URL`
/// is set.
pub async fn base_url() -> &'static str {
    let shared = SHARED_PG
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("PROCTOR_TEST_PG_URL") {
                return SharedPg {
                    base_url: url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("failed to get host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");

            SharedPg {
                base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await;
    &shared.base_url
}

/// One connection to the shared server's `postgres` maintenance database,
/// for CREATE/DROP DATABASE statements.
async fn maintenance_conn(base: &str) -> PgConnection {
    PgConnection::connect(&format!("{base}/postgres"))
        .await
        .expect("failed to connect to maintenance database")
}

/// A disposable, fully migrated database claimed by one test.
///
/// Call [`TestDb::teardown`] at the end of the test; a leaked database
/// only wastes space in the shared instance, it cannot corrupt other
/// tests.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a uniquely named database in the shared instance and apply
    /// all migrations.
    pub async fn new() -> Self {
        let base = base_url().await;
        let name = format!("proctor_test_{}", Uuid::new_v4().simple());

        let mut maint = maintenance_conn(base).await;
        maint
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create test database {name}: {e}"));
        let _ = maint.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{base}/{name}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e}"));

        MIGRATOR
            .run(&pool)
            .await
            .expect("migrations should apply to a fresh test database");

        Self { pool, name }
    }

    /// The generated database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the pool and drop the database. Best-effort: a server that
    /// disappeared mid-test only makes the drop a no-op.
    pub async fn teardown(self) {
        self.pool.close().await;

        let base = base_url().await;
        let mut maint = maintenance_conn(base).await;
        // Kick any straggling connections before the drop.
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) \
             FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = maint.execute(terminate.as_str()).await;
        let _ = maint
            .execute(format!("DROP DATABASE IF EXISTS {}", self.name).as_str())
            .await;
        let _ = maint.close().await;
    }
}
