use crate::error::{MessError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Command-line overrides for the ambient environment-variable config.
/// Flags win over `MESS_*` env vars when both are set (spec §6).
#[derive(Debug, Parser)]
#[command(name = "mess", about = "A task-execution bot server")]
pub struct Cli {
    /// `-port`: TCP port to bind.
    #[arg(long)]
    pub port: Option<u16>,
    /// `-local`: bind loopback only and bypass auth for loopback callers.
    #[arg(long)]
    pub local: bool,
    /// `-cid`: OAuth2 client id handed to bots in the handshake response.
    #[arg(long)]
    pub cid: Option<String>,
    /// `-usr`: comma-separated identity allow-list, additive to `MESS_USR`.
    #[arg(long)]
    pub usr: Option<String>,
}

/// Which Store backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    Memory,
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Path to `db.json.zst` (memory backend) or the sqlite file (sql backend).
    pub path: PathBuf,
    pub snapshot_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputStoreConfig {
    pub root: PathBuf,
    pub idle_cutoff_secs: u64,
    pub max_open: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// `-local`: bind loopback only and bypass auth for loopback callers.
    pub bind_loopback_only: bool,
    /// `-usr`: comma-separated identity allow-list. Empty denies everyone
    /// except a loopback caller under `bind_loopback_only`.
    pub allowed_identities: Vec<String>,
    /// `-cid`: OAuth2 client id handed to bots in the handshake response.
    pub oauth_client_id: String,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub output_store: OutputStoreConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Loads configuration from environment variables (optionally via a
    /// `.env` file), validating eagerly so a bad value fails startup rather
    /// than surfacing as a confusing runtime error later.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(?path, "loaded .env file"),
            Err(_) => tracing::debug!("no .env file found, using process environment"),
        }

        let backend = match env::var("MESS_STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "sql" => StoreBackend::Sql,
            other => {
                return Err(MessError::Configuration(format!(
                    "MESS_STORE_BACKEND must be 'memory' or 'sql', got '{other}'"
                )))
            }
        };

        let default_store_path = match backend {
            StoreBackend::Memory => "db.json.zst",
            StoreBackend::Sql => "db.sqlite3",
        };
        let store_path: PathBuf = env::var("MESS_STORE_PATH")
            .unwrap_or_else(|_| default_store_path.to_string())
            .into();

        let snapshot_interval_secs = parse_env_or(
            "MESS_SNAPSHOT_INTERVAL_SECS",
            crate::constants::SNAPSHOT_INTERVAL_SECS,
        )?;

        let output_root: PathBuf = env::var("MESS_OUTPUT_ROOT")
            .unwrap_or_else(|_| "outputs".to_string())
            .into();
        let idle_cutoff_secs = parse_env_or(
            "MESS_OUTPUT_IDLE_CUTOFF_SECS",
            crate::constants::OUTPUT_STORE_DEFAULT_CUTOFF_SECS,
        )?;
        let max_open = parse_env_or(
            "MESS_OUTPUT_MAX_OPEN",
            crate::constants::OUTPUT_STORE_DEFAULT_MAX_OPEN,
        )?;

        let host = env::var("MESS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env_or("MESS_PORT", 8080u16)?;
        let bind_loopback_only = env::var("MESS_LOCAL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let allowed_identities: Vec<String> = env::var("MESS_USR")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if allowed_identities.is_empty() && !bind_loopback_only {
            tracing::warn!(
                "no identities configured in MESS_USR and MESS_LOCAL is not set; \
                 every non-loopback request will be rejected"
            );
        }

        let oauth_client_id = env::var("MESS_CID").unwrap_or_default();

        let allowed_origins = env::var("MESS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            store: StoreConfig {
                backend,
                path: store_path,
                snapshot_interval_secs,
            },
            output_store: OutputStoreConfig {
                root: output_root,
                idle_cutoff_secs,
                max_open,
            },
            api: ApiConfig {
                host,
                port,
                bind_loopback_only,
                allowed_identities,
                oauth_client_id,
                allowed_origins,
            },
        })
    }
}

impl Config {
    /// Overlays CLI flags onto an already-loaded config. Flags win; absent
    /// flags leave the env-derived value untouched.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.api.port = port;
        }
        if cli.local {
            self.api.bind_loopback_only = true;
        }
        if let Some(cid) = &cli.cid {
            self.api.oauth_client_id = cid.clone();
        }
        if let Some(usr) = &cli.usr {
            self.api.allowed_identities.extend(
                usr.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            );
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| MessError::Configuration(format!("{key} is not a valid value"))),
        Err(_) => Ok(default),
    }
}
