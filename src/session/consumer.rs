//! Consumer Session Handler: subscribes a WebSocket consumer to a user's
//! feature/raw topics and relays predictions back to the edge. Two
//! cooperative tasks run concurrently — forward (topic → consumer) and
//! receive (consumer → edge) — and cancelling one cancels the other,
//! mirroring the biased-select cooperative-task shape used elsewhere for
//! long-lived streaming connections.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::constants::{features_topic, raw_topic};
use crate::metrics::Metrics;
use crate::persistence::{PersistencePipeline, PredictionRecord};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::session::envelope::ConsumerMessage;
use crate::shutdown::ShutdownService;
use crate::topics::{BroadcastSubscription, TopicService};

#[derive(Clone)]
pub struct ConsumerSessionContext {
    pub connections: Arc<ConnectionRegistry>,
    pub topics: Arc<TopicService>,
    pub persistence: Arc<PersistencePipeline>,
    pub metrics: Arc<Metrics>,
    pub shutdown: ShutdownService,
}

pub async fn run(socket: WebSocket, user_id: String, ctx: ConsumerSessionContext) {
    let consumer_id = format!("consumer-{}", Uuid::new_v4());
    let (sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut sink = sink;
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    if ctx.shutdown.is_triggered() {
        writer.abort();
        return;
    }

    ctx.connections
        .connect_consumer(&consumer_id, ConnectionHandle::new(tx.clone()));
    ctx.metrics.consumer_connections.inc();
    tracing::info!(consumer_id, user_id, "consumer subscribed");

    let features_sub = ctx.topics.subscribe(&features_topic(&user_id)).await;
    let raw_sub = ctx.topics.subscribe(&raw_topic(&user_id)).await;

    let forward_tx = tx.clone();
    let mut forward_handle = tokio::spawn(async move {
        forward_topics_to_consumer(features_sub, raw_sub, forward_tx).await;
    });

    let ctx_for_receive = ctx.clone();
    let user_id_for_receive = user_id.clone();
    let mut receive_handle =
        tokio::spawn(async move { receive_from_consumer(stream, ctx_for_receive, user_id_for_receive).await });

    tokio::select! {
        _ = &mut forward_handle => { receive_handle.abort(); }
        _ = &mut receive_handle => { forward_handle.abort(); }
    }

    ctx.connections.disconnect_consumer(&consumer_id);
    ctx.metrics.consumer_connections.dec();
    writer.abort();
    tracing::info!(consumer_id, user_id, "consumer disconnected");
}

/// Forward messages from either topic to the consumer, msgpack-decoded then
/// re-sent as JSON. Exits when both subscriptions are exhausted or failed.
async fn forward_topics_to_consumer(
    features_sub: Result<BroadcastSubscription, crate::topics::TopicError>,
    raw_sub: Result<BroadcastSubscription, crate::topics::TopicError>,
    tx: mpsc::UnboundedSender<Message>,
) {
    let mut features_stream = match features_sub {
        Ok(sub) => Some(sub.receiver),
        Err(e) => {
            tracing::warn!(error = %e, "failed to subscribe to features topic");
            None
        }
    };
    let mut raw_stream = match raw_sub {
        Ok(sub) => Some(sub.receiver),
        Err(e) => {
            tracing::warn!(error = %e, "failed to subscribe to raw topic");
            None
        }
    };

    if features_stream.is_none() && raw_stream.is_none() {
        return;
    }

    loop {
        let features_next = async {
            match &mut features_stream {
                Some(s) => s.next().await,
                None => std::future::pending().await,
            }
        };
        let raw_next = async {
            match &mut raw_stream {
                Some(s) => s.next().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            item = features_next => {
                if !forward_one(item, &tx) { features_stream = None; }
            }
            item = raw_next => {
                if !forward_one(item, &tx) { raw_stream = None; }
            }
        }

        if features_stream.is_none() && raw_stream.is_none() {
            break;
        }
    }
}

/// Decode and forward one topic message. Returns `false` when the owning
/// stream has ended and should not be polled again.
fn forward_one(
    item: Option<Result<Vec<u8>, crate::topics::TopicError>>,
    tx: &mpsc::UnboundedSender<Message>,
) -> bool {
    match item {
        Some(Ok(payload)) => {
            match rmp_serde::from_slice::<serde_json::Value>(&payload) {
                Ok(value) => {
                    if let Ok(text) = serde_json::to_string(&value) {
                        let _ = tx.send(Message::Text(text.into()));
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to decode topic payload"),
            }
            true
        }
        Some(Err(crate::topics::TopicError::Lagged(n))) => {
            tracing::warn!(lagged = n, "consumer subscriber lagged behind");
            true
        }
        Some(Err(_)) => false,
        None => false,
    }
}

async fn receive_from_consumer(
    mut stream: impl futures::Stream<Item = Result<Message, axum::Error>> + Unpin,
    ctx: ConsumerSessionContext,
    user_id: String,
) {
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            next = stream.next() => match next {
                Some(Ok(message)) => message,
                _ => break,
            },
        };

        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => continue,
        };

        let parsed: ConsumerMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, user_id, "dropping malformed consumer message");
                continue;
            }
        };

        if !parsed.is_prediction() {
            continue;
        }

        let delivered = ctx.connections.send_to_edge(&user_id, &parsed);
        if !delivered {
            continue;
        }

        if ctx.persistence.is_enabled() {
            let Some(session_id) = parsed.session_id else {
                continue;
            };
            ctx.persistence
                .add_prediction(PredictionRecord {
                    timestamp: Utc::now(),
                    session_id,
                    user_id: user_id.clone(),
                    prediction_type: parsed.resolved_prediction_type(),
                    classifier_name: parsed.resolved_classifier_name(),
                    data: parsed.data.clone(),
                    confidence: parsed.resolved_confidence(),
                    classifier_version: parsed.version.clone(),
                    processing_time_ms: None,
                })
                .await;
        }
    }
}
