//! WebSocket upgrade handlers: wire the axum upgrade into the edge and
//! consumer session handlers, which own the connection for its full lifetime.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;

use crate::api::AppState;
use crate::session::consumer::{self, ConsumerSessionContext};
use crate::session::edge::{self, EdgeSessionContext};

pub async fn edge_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let shutdown = state.shutdown.clone();
    let ctx = EdgeSessionContext {
        buffers: state.buffers,
        connections: state.connections,
        topics: state.topics,
        persistence: state.persistence,
        metrics: state.metrics,
        shutdown: state.shutdown,
        edge_api_key: state.edge_api_key,
        enable_redis_pubsub: state.enable_redis_pubsub,
    };
    ws.on_upgrade(move |socket| async move {
        let handle = tokio::spawn(edge::run(socket, ctx));
        shutdown.register(handle).await;
    })
}

pub async fn consumer_subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let shutdown = state.shutdown.clone();
    let ctx = ConsumerSessionContext {
        connections: state.connections,
        topics: state.topics,
        persistence: state.persistence,
        metrics: state.metrics,
        shutdown: state.shutdown,
    };
    ws.on_upgrade(move |socket| async move {
        let handle = tokio::spawn(consumer::run(socket, user_id, ctx));
        shutdown.register(handle).await;
    })
}
