//! Configuration file management for proctor.
//!
//! Provides a TOML-based config file at `~/.config/proctor/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use proctor_core::config::CoreConfig;
use proctor_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub webhook: WebhookSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookSection {
    /// Hex-encoded HMAC secret for push-webhook signatures (64 hex chars
    /// = 32 bytes).
    pub secret: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the proctor config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/proctor` or
/// `~/.config/proctor`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("proctor");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("proctor")
}

/// Return the path to the proctor config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Webhook secret generation
// -----------------------------------------------------------------------

/// Generate a random webhook secret: 32 random bytes, hex-encoded.
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ProctorConfig {
    pub db_config: DbConfig,
    pub core: CoreConfig,
    /// Webhook secret; `None` disables webhook signature checks entirely
    /// (the endpoint then rejects all requests).
    pub webhook_secret: Option<String>,
}

impl ProctorConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB: `cli_db_url` > `PROCTOR_DATABASE_URL` > file > the
    ///   `PROCTOR_DB_*` parts and their defaults
    /// - Webhook secret: `PROCTOR_WEBHOOK_SECRET` > file > none
    /// - Core tunables: environment with compiled defaults
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_config = if let Some(url) = cli_db_url {
            DbConfig::new(url)
        } else if std::env::var("PROCTOR_DATABASE_URL").is_ok() {
            DbConfig::from_env()
        } else if let Some(cfg) = &file_config {
            DbConfig::new(cfg.database.url.clone())
        } else {
            // No explicit URL anywhere: from_env composes one from the
            // PROCTOR_DB_* parts, falling back to localhost defaults.
            DbConfig::from_env()
        };

        let webhook_secret = std::env::var("PROCTOR_WEBHOOK_SECRET")
            .ok()
            .or_else(|| file_config.as_ref().map(|cfg| cfg.webhook.secret.clone()));

        Ok(Self {
            db_config,
            core: CoreConfig::from_env(),
            webhook_secret,
        })
    }
}
