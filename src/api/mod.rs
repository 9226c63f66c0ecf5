//! HTTP/WebSocket surface: router assembly over REST handlers and the two
//! WebSocket upgrade endpoints.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::routing::{delete, get};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::buffer::BufferRegistry;
use crate::metrics::Metrics;
use crate::persistence::PersistencePipeline;
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownService;
use crate::topics::TopicService;

/// Shared services reachable from every handler via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub buffers: Arc<BufferRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub topics: Arc<TopicService>,
    pub persistence: Arc<PersistencePipeline>,
    pub metrics: Arc<Metrics>,
    pub shutdown: ShutdownService,
    pub edge_api_key: String,
    pub enable_redis_pubsub: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/health/ready", get(routes::ready))
        .route("/buffer/{user_id}", delete(routes::buffer_clear))
        .route("/buffer/{user_id}/latest", get(routes::buffer_latest))
        .route("/buffer/{user_id}/last/{n}", get(routes::buffer_last_n))
        .route("/buffer/{user_id}/range", get(routes::buffer_range))
        .route("/buffer/{user_id}/stats", get(routes::buffer_stats))
        .route("/stats", get(routes::stats))
        .route("/metrics", get(routes::metrics))
        .route("/stream", get(ws::edge_stream))
        .route("/subscribe/{user_id}", get(ws::consumer_subscribe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
