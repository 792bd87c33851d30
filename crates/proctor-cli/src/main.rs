mod client_cmds;
mod config;
mod serve_cmd;
mod wiring;
mod work_cmd;

use clap::{Parser, Subcommand};

use proctor_db::pool;

use config::ProctorConfig;

#[derive(Parser)]
#[command(name = "proctor", about = "Browser-test lifecycle orchestrator")]
struct Cli {
    /// Database URL (overrides PROCTOR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a proctor config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/proctor")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the proctor database (requires config file or env vars)
    DbInit,
    /// Run the ingress, router, and agent fleet in one process
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 4000)]
        port: u16,
        /// Use the in-memory database collaborator (simulate mode)
        #[arg(long)]
        memory_db: bool,
    },
    /// Run the router and agent fleet without the HTTP ingress
    Work {
        /// Use the in-memory database collaborator (simulate mode)
        #[arg(long)]
        memory_db: bool,
    },
    /// Submit an execution to a running serve process
    Submit {
        /// Test file to run (omit for a broad run)
        #[arg(long)]
        test_file: Option<String>,
        /// Test-name filter
        #[arg(long)]
        grep: Option<String>,
        /// Base URL of the serve process
        #[arg(long, default_value = "http://127.0.0.1:4000")]
        server: String,
    },
    /// Request cancellation of an execution
    Cancel {
        /// Execution ID to cancel
        execution_id: String,
        /// Base URL of the serve process
        #[arg(long, default_value = "http://127.0.0.1:4000")]
        server: String,
    },
    /// Show queue depths and bus counters
    Status {
        /// Base URL of the serve process
        #[arg(long, default_value = "http://127.0.0.1:4000")]
        server: String,
    },
    /// Administrative bus reset (queues, DLQ, leases, markers, audit)
    Reset {
        /// Base URL of the serve process
        #[arg(long, default_value = "http://127.0.0.1:4000")]
        server: String,
    },
}

/// Execute the `proctor init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let secret = config::generate_webhook_secret();
    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        webhook: config::WebhookSection {
            secret: secret.clone(),
        },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  webhook.secret = {}...{}", &secret[..8], &secret[56..]);
    println!();
    println!("Next: run `proctor db-init` to create and migrate the database.");
    Ok(())
}

/// Execute the `proctor db-init` command: create the database if missing
/// and bring the schema up to date.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ProctorConfig::resolve(cli_db_url)?;

    println!("Initializing proctor database...");

    let db_pool = pool::bootstrap(&resolved.db_config).await?;

    let summary = pool::storage_summary(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in summary.rows() {
        println!("  {table:<20} {count} rows");
    }
    db_pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port, memory_db } => {
            let resolved = ProctorConfig::resolve(cli.database_url.as_deref())?;
            serve_cmd::run_serve(&resolved, &bind, port, memory_db).await?;
        }
        Commands::Work { memory_db } => {
            let resolved = ProctorConfig::resolve(cli.database_url.as_deref())?;
            work_cmd::run_work(&resolved, memory_db).await?;
        }
        Commands::Submit {
            test_file,
            grep,
            server,
        } => {
            client_cmds::run_submit(&server, test_file.as_deref(), grep.as_deref()).await?;
        }
        Commands::Cancel {
            execution_id,
            server,
        } => {
            client_cmds::run_cancel(&server, &execution_id).await?;
        }
        Commands::Status { server } => {
            client_cmds::run_status(&server).await?;
        }
        Commands::Reset { server } => {
            client_cmds::run_reset(&server).await?;
        }
    }

    Ok(())
}
