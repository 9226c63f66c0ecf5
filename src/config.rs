//! Application configuration: CLI flags layered over environment variables,
//! layered over fixed defaults.

use clap::Parser;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_CAPACITY, DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_HOST,
    DEFAULT_PORT, ENV_DATABASE_URL, ENV_EDGE_API_KEY, ENV_ENABLE_DB_PERSISTENCE,
    ENV_ENABLE_REDIS_PUBSUB, ENV_HOST, ENV_LOG, ENV_PORT, ENV_REDIS_URL,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "signalbridge")]
#[command(version, about = "Real-time telemetry broker for edge biosignal streams", long_about = None)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket server to
    #[arg(long, env = ENV_HOST)]
    pub host: Option<String>,

    /// Port to bind the HTTP/WebSocket server to
    #[arg(long, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Log level / tracing filter
    #[arg(long, env = ENV_LOG)]
    pub log_level: Option<String>,

    /// PostgreSQL connection URL
    #[arg(long, env = ENV_DATABASE_URL)]
    pub database_url: Option<String>,

    /// Redis connection URL, used for the pub/sub topic backend
    #[arg(long, env = ENV_REDIS_URL)]
    pub redis_url: Option<String>,

    /// Shared secret that inbound edge connections must present
    #[arg(long, env = ENV_EDGE_API_KEY)]
    pub edge_api_key: Option<String>,

    /// Enable batched writes of predictions/raw samples to the database
    #[arg(long, env = ENV_ENABLE_DB_PERSISTENCE)]
    pub enable_db_persistence: Option<bool>,

    /// Enable fan-out of features/raw samples over the pub/sub transport
    #[arg(long, env = ENV_ENABLE_REDIS_PUBSUB)]
    pub enable_redis_pubsub: Option<bool>,
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub edge_api_key: String,
    pub enable_db_persistence: bool,
    pub enable_redis_pubsub: bool,
    pub buffer_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

impl AppConfig {
    /// Parse CLI arguments (with env-var fallback via clap) and apply fixed defaults.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let enable_db_persistence = cli.enable_db_persistence.unwrap_or(true);
        if enable_db_persistence && cli.database_url.is_none() {
            anyhow::bail!(
                "DATABASE_URL is required when database persistence is enabled (pass --database-url or set ENABLE_DB_PERSISTENCE=false)"
            );
        }

        let enable_redis_pubsub = cli.enable_redis_pubsub.unwrap_or(true);
        if enable_redis_pubsub && cli.redis_url.is_none() {
            anyhow::bail!(
                "REDIS_URL is required when pub/sub fan-out is enabled (pass --redis-url or set ENABLE_REDIS_PUBSUB=false)"
            );
        }

        Ok(Self {
            host: cli.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.unwrap_or(DEFAULT_PORT),
            log_level: cli.log_level.unwrap_or_else(|| "info".to_string()),
            database_url: cli.database_url,
            redis_url: cli.redis_url,
            edge_api_key: cli.edge_api_key.unwrap_or_default(),
            enable_db_persistence,
            enable_redis_pubsub,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            host: None,
            port: None,
            log_level: None,
            database_url: Some("postgres://localhost/test".into()),
            redis_url: Some("redis://localhost".into()),
            edge_api_key: Some("k".into()),
            enable_db_persistence: None,
            enable_redis_pubsub: None,
        }
    }

    #[test]
    fn defaults_applied_when_unset() {
        let config = AppConfig::from_cli(base_cli()).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.enable_db_persistence);
        assert!(config.enable_redis_pubsub);
    }

    #[test]
    fn missing_database_url_rejected_when_persistence_enabled() {
        let mut cli = base_cli();
        cli.database_url = None;
        cli.enable_db_persistence = Some(true);
        assert!(AppConfig::from_cli(cli).is_err());
    }

    #[test]
    fn persistence_disabled_allows_missing_database_url() {
        let mut cli = base_cli();
        cli.database_url = None;
        cli.enable_db_persistence = Some(false);
        assert!(AppConfig::from_cli(cli).is_ok());
    }
}
