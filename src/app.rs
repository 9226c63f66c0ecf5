//! Application lifecycle: construct every long-lived service in dependency
//! order, serve HTTP/WebSocket traffic, and drain everything on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::api::{self, AppState};
use crate::buffer::BufferRegistry;
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::persistence::{PersistencePipeline, PostgresStore};
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownService;
use crate::topics::TopicService;
use crate::utils::retry::{retry_with_backoff_async, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};

/// Owns every long-lived service constructed at startup.
pub struct BrokerApp {
    pub config: AppConfig,
    pub metrics: Arc<Metrics>,
    pub buffers: Arc<BufferRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub topics: Arc<TopicService>,
    pub persistence: Arc<PersistencePipeline>,
    pub shutdown: ShutdownService,
}

/// Attempt to reach Redis with exponential backoff, surfacing the connected
/// service on success and `None` once attempts are exhausted rather than
/// aborting boot — a sink that can't be reached at startup is logged and
/// skipped, per the startup-resilience contract.
async fn connect_redis_with_retry(redis_url: &str) -> Option<TopicService> {
    let connected = std::cell::RefCell::new(None);
    let outcome = retry_with_backoff_async(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY_MS, || async {
        match TopicService::redis(redis_url).await {
            Ok(service) => {
                *connected.borrow_mut() = Some(service);
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    })
    .await;

    match outcome {
        Ok(_) => connected.take(),
        Err((e, attempts)) => {
            tracing::warn!(error = %e, attempts, "failed to connect to redis");
            None
        }
    }
}

impl BrokerApp {
    /// Parse configuration, wire up every service, and run until shutdown.
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();

        let config = AppConfig::load()?;
        Self::init_logging(&config.log_level);

        let app = Self::init(config).await?;
        Self::start_server(app).await
    }

    async fn init(config: AppConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new().context("failed to initialize metrics registry")?);

        let topics = if config.enable_redis_pubsub {
            let redis_url = config
                .redis_url
                .clone()
                .expect("redis_url validated present by AppConfig::load when pubsub is enabled");
            match connect_redis_with_retry(&redis_url).await {
                Some(service) => service,
                None => {
                    tracing::warn!(
                        "redis pub/sub unreachable at startup, falling back to in-process fan-out"
                    );
                    TopicService::memory()
                }
            }
        } else {
            TopicService::memory()
        };
        tracing::debug!(backend = topics.backend_name(), "topic backend initialized");
        let topics = Arc::new(topics);

        let persistence = if config.enable_db_persistence {
            let database_url = config
                .database_url
                .clone()
                .expect("database_url validated present by AppConfig::load when persistence is enabled");
            let store = Arc::new(
                PostgresStore::connect(&database_url)
                    .await
                    .context("failed to connect to the database")?,
            );
            Arc::new(PersistencePipeline::new(
                store,
                config.batch_size,
                config.flush_interval_secs,
                metrics.clone(),
            ))
        } else {
            tracing::warn!("database persistence disabled, predictions and raw samples will not be durably stored");
            Arc::new(PersistencePipeline::new_disabled(metrics.clone()))
        };

        let buffers = Arc::new(BufferRegistry::new(config.buffer_capacity));
        let connections = Arc::new(ConnectionRegistry::new());
        let shutdown = ShutdownService::new(topics.clone(), persistence.clone());

        Ok(Self {
            config,
            metrics,
            buffers,
            connections,
            topics,
            persistence,
            shutdown,
        })
    }

    fn init_logging(log_level: &str) {
        let default_filter = format!("{log_level},{}=debug", crate::constants::APP_NAME_LOWER);
        let filter = std::env::var("RUST_LOG").unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        app.shutdown.install_signal_handlers();
        app.persistence.start();

        let shutdown = app.shutdown.clone();
        let host = app.config.host.clone();
        let port = app.config.port;
        let addr: SocketAddr = format!("{host}:{port}").parse()?;

        let state = AppState {
            buffers: app.buffers,
            connections: app.connections,
            topics: app.topics,
            persistence: app.persistence,
            metrics: app.metrics,
            shutdown: shutdown.clone(),
            edge_api_key: app.config.edge_api_key,
            enable_redis_pubsub: app.config.enable_redis_pubsub,
        };
        let router = api::router(state);

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, "signalbridge listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.wait())
            .await
            .context("server error")?;

        shutdown.shutdown().await;
        Ok(())
    }
}
