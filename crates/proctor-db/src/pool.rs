//! Connection handling and schema bootstrap.
//!
//! Migrations are embedded at compile time, so an installed `proctor`
//! binary never needs the source tree. `bootstrap` is the one-call path
//! used by `proctor db-init`: connect, create the database if the server
//! reports it missing, and bring the schema up to date.

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// All schema migrations, embedded from `migrations/` at compile time.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// PostgreSQL SQLSTATE for "database does not exist".
const UNDEFINED_DATABASE: &str = "3D000";

/// Open a pool against the configured database.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// Connect, creating the database and applying migrations as needed.
///
/// The first connection attempt doubles as the existence check: only a
/// server error with SQLSTATE `3D000` triggers `CREATE DATABASE`, anything
/// else (bad host, bad credentials) propagates unchanged.
pub async fn bootstrap(config: &DbConfig) -> Result<PgPool> {
    let pool = match connect(config).await {
        Ok(pool) => pool,
        Err(err) if undefined_database(&err) => {
            create_database(config).await?;
            connect(config).await?
        }
        Err(err) => return Err(err),
    };

    MIGRATOR
        .run(&pool)
        .await
        .context("failed to apply database migrations")?;
    info!("database schema is up to date");
    Ok(pool)
}

/// Whether an error chain bottoms out in "database does not exist".
fn undefined_database(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| match e {
            sqlx::Error::Database(db) => db.code().map(|code| code == UNDEFINED_DATABASE),
            _ => None,
        })
        .unwrap_or(false)
}

/// Issue `CREATE DATABASE` through the maintenance database.
async fn create_database(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("could not determine database name from URL")?;

    // Database names cannot be parameterised in CREATE DATABASE, so only
    // plain identifiers are accepted.
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("database name {name:?} contains invalid characters");
    }

    let maintenance_url = config.maintenance_url();
    let mut conn = PgConnection::connect(&maintenance_url)
        .await
        .with_context(|| {
            format!("failed to connect to maintenance database at {maintenance_url}")
        })?;
    conn.execute(format!("CREATE DATABASE {name}").as_str())
        .await
        .with_context(|| format!("failed to create database {name}"))?;
    let _ = conn.close().await;

    info!(db = name, "database created");
    Ok(())
}

/// Row counts for every proctor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSummary {
    pub executions: i64,
    pub test_artifacts: i64,
    pub execution_reports: i64,
    pub test_reports: i64,
    pub log_entries: i64,
    pub recommendations: i64,
}

impl StorageSummary {
    /// The counts as `(table, rows)` pairs, in display order.
    pub fn rows(&self) -> [(&'static str, i64); 6] {
        [
            ("executions", self.executions),
            ("test_artifacts", self.test_artifacts),
            ("execution_reports", self.execution_reports),
            ("test_reports", self.test_reports),
            ("log_entries", self.log_entries),
            ("recommendations", self.recommendations),
        ]
    }
}

/// Count the rows in each proctor table in one round trip. Used for the
/// `proctor db-init` success message.
pub async fn storage_summary(pool: &PgPool) -> Result<StorageSummary> {
    let (executions, test_artifacts, execution_reports, test_reports, log_entries, recommendations): (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        "SELECT \
           (SELECT COUNT(*) FROM executions), \
           (SELECT COUNT(*) FROM test_artifacts), \
           (SELECT COUNT(*) FROM execution_reports), \
           (SELECT COUNT(*) FROM test_reports), \
           (SELECT COUNT(*) FROM log_entries), \
           (SELECT COUNT(*) FROM recommendations)",
    )
    .fetch_one(pool)
    .await
    .context("failed to count table rows")?;

    Ok(StorageSummary {
        executions,
        test_artifacts,
        execution_reports,
        test_reports,
        log_entries,
        recommendations,
    })
}
