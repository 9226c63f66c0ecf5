//! Edge Session Handler: authenticates an inbound edge WebSocket, opens a
//! persistent session row, runs the inbound message loop, tears everything
//! down on disconnect. One task per connection, no internal concurrency —
//! outbound frames (acks, forwarded predictions) are written through the
//! same channel the Connection Registry holds a handle to.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::buffer::{BufferRegistry, Sample, SampleKind};
use crate::constants::{AUTH_TIMEOUT_SECS, features_topic, raw_topic};
use crate::metrics::Metrics;
use crate::persistence::{NewSession, PersistencePipeline, PredictionRecord, RawSampleRecord};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::session::envelope::{AuthAck, FrameType, HeartbeatAck, decode_edge_frame_binary, decode_edge_frame_text};
use crate::shutdown::ShutdownService;
use crate::topics::TopicService;

const CLOSE_CODE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_CODE_GOING_AWAY: u16 = 1001;

/// Shared services an edge session needs; cloned cheaply per connection.
#[derive(Clone)]
pub struct EdgeSessionContext {
    pub buffers: Arc<BufferRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub topics: Arc<TopicService>,
    pub persistence: Arc<PersistencePipeline>,
    pub metrics: Arc<Metrics>,
    pub shutdown: ShutdownService,
    pub edge_api_key: String,
    pub enable_redis_pubsub: bool,
}

/// Drive one edge connection end to end. Never panics on protocol errors —
/// everything short of a transport failure is absorbed and logged.
pub async fn run(socket: WebSocket, ctx: EdgeSessionContext) {
    let (sink, mut stream) = socket.split();
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
        close(&tx, CLOSE_CODE_GOING_AWAY, "Server is shutting down");
        writer.abort();
        return;
    }

    let auth_result = tokio::time::timeout(
        Duration::from_secs(AUTH_TIMEOUT_SECS),
        await_auth(&mut stream, &ctx),
    )
    .await;

    let (user_id, device_info) = match auth_result {
        Err(_) => {
            close(&tx, CLOSE_CODE_POLICY_VIOLATION, "Authentication timeout");
            writer.abort();
            return;
        }
        Ok(AuthOutcome::InvalidApiKey) => {
            close(&tx, CLOSE_CODE_POLICY_VIOLATION, "Invalid API key");
            writer.abort();
            return;
        }
        Ok(AuthOutcome::MissingUserId) => {
            close(&tx, CLOSE_CODE_POLICY_VIOLATION, "Missing user_id");
            writer.abort();
            return;
        }
        Ok(AuthOutcome::Disconnected) => {
            writer.abort();
            return;
        }
        Ok(AuthOutcome::Authenticated { user_id, device_info }) => (user_id, device_info),
    };

    let session_id = Uuid::new_v4();
    let start_time = Utc::now();

    if let Err(e) = ctx
        .persistence
        .open_session(&NewSession {
            session_id,
            user_id: user_id.clone(),
            start_time,
            device_info,
        })
        .await
    {
        tracing::warn!(error = %e, user_id, "failed to open session row");
    }

    ctx.connections
        .connect_edge(&user_id, ConnectionHandle::new(tx.clone()));
    ctx.buffers.ensure(&user_id);
    ctx.metrics
        .buffer_capacity
        .with_label_values(&[user_id.as_str()])
        .set(ctx.buffers.capacity() as f64);

    ctx.metrics.edge_relay_connections.inc();
    ctx.metrics.active_sessions.inc();
    ctx.metrics.sessions_created_total.inc();
    tracing::info!(user_id, %session_id, "edge relay authenticated");

    let ack = AuthAck::new(session_id);
    send_json(&tx, &ack);

    message_loop(&mut stream, &ctx, &tx, &user_id, session_id).await;

    ctx.connections.disconnect_edge(&user_id);
    ctx.metrics.edge_relay_connections.dec();
    ctx.metrics.active_sessions.dec();
    ctx.metrics.sessions_ended_total.inc();

    if let Err(e) = ctx.persistence.close_session(session_id, Utc::now()).await {
        tracing::warn!(error = %e, %session_id, "failed to close session row");
    }

    writer.abort();
    tracing::info!(user_id, %session_id, "edge relay disconnected");
}

enum AuthOutcome {
    Authenticated {
        user_id: String,
        device_info: serde_json::Value,
    },
    InvalidApiKey,
    MissingUserId,
    Disconnected,
}

async fn await_auth(
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    ctx: &EdgeSessionContext,
) -> AuthOutcome {
    let Some(Ok(message)) = stream.next().await else {
        return AuthOutcome::Disconnected;
    };

    let text = match message {
        Message::Text(text) => text.to_string(),
        _ => return AuthOutcome::InvalidApiKey,
    };

    let value: serde_json::Value = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
    let api_key = value.get("api_key").and_then(|v| v.as_str());
    if api_key != Some(ctx.edge_api_key.as_str()) {
        return AuthOutcome::InvalidApiKey;
    }

    let user_id = match value.get("user_id").and_then(|v| v.as_str()) {
        Some(uid) if !uid.is_empty() => uid.to_string(),
        _ => return AuthOutcome::MissingUserId,
    };

    let device_info = value
        .get("device_info")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    AuthOutcome::Authenticated { user_id, device_info }
}

async fn message_loop(
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    ctx: &EdgeSessionContext,
    tx: &mpsc::UnboundedSender<Message>,
    user_id: &str,
    session_id: Uuid,
) {
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    close(tx, CLOSE_CODE_GOING_AWAY, "Server is shutting down");
                    break;
                }
                continue;
            }
            next = stream.next() => match next {
                Some(Ok(message)) => message,
                _ => break,
            },
        };

        let frame = match message {
            Message::Text(text) => decode_edge_frame_text(&text),
            Message::Binary(bytes) => decode_edge_frame_binary(&bytes),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, user_id, "dropping malformed edge frame");
                continue;
            }
        };

        match frame.frame_type {
            FrameType::Features => handle_features(ctx, user_id, session_id, frame.payload).await,
            FrameType::Raw => handle_raw(ctx, user_id, session_id, frame.payload).await,
            FrameType::Heartbeat => send_json(tx, &HeartbeatAck::default()),
            FrameType::Unknown => {
                tracing::warn!(user_id, "unknown edge frame type, dropping");
            }
        }
    }
}

async fn handle_features(ctx: &EdgeSessionContext, user_id: &str, session_id: Uuid, payload: serde_json::Value) {
    let timestamp = Utc::now();
    ctx.metrics
        .messages_received_total
        .with_label_values(&["features", user_id])
        .inc();

    let buffer = ctx.buffers.ensure(user_id);
    buffer.append(Sample {
        timestamp,
        session_id,
        user_id: user_id.to_string(),
        kind: SampleKind::Features,
        data: payload.clone(),
        metadata: serde_json::Value::Null,
    });
    ctx.metrics
        .buffer_gauge(user_id)
        .set(buffer.stats().total_samples as f64);

    if ctx.enable_redis_pubsub {
        publish_payload(ctx, "features", &features_topic(user_id), &payload).await;
    }

    if ctx.persistence.is_enabled() {
        let confidence = payload.get("confidence").and_then(|v| v.as_f64());
        ctx.persistence
            .add_prediction(PredictionRecord {
                timestamp,
                session_id,
                user_id: user_id.to_string(),
                prediction_type: "workload_edge".to_string(),
                classifier_name: "edge_relay".to_string(),
                data: payload,
                confidence,
                classifier_version: None,
                processing_time_ms: None,
            })
            .await;
    }

    ctx.metrics
        .messages_processed_total
        .with_label_values(&["features"])
        .inc();
}

async fn handle_raw(ctx: &EdgeSessionContext, user_id: &str, session_id: Uuid, payload: serde_json::Value) {
    let timestamp = Utc::now();
    ctx.metrics
        .messages_received_total
        .with_label_values(&["raw", user_id])
        .inc();

    let buffer = ctx.buffers.ensure(user_id);
    buffer.append(Sample {
        timestamp,
        session_id,
        user_id: user_id.to_string(),
        kind: SampleKind::Raw,
        data: payload.clone(),
        metadata: serde_json::Value::Null,
    });

    if ctx.enable_redis_pubsub {
        publish_payload(ctx, "raw", &raw_topic(user_id), &payload).await;
    }

    if ctx.persistence.is_enabled() {
        ctx.persistence
            .add_raw_sample(RawSampleRecord {
                timestamp,
                session_id,
                user_id: user_id.to_string(),
                data: payload,
            })
            .await;
    }

    ctx.metrics
        .messages_processed_total
        .with_label_values(&["raw"])
        .inc();
}

async fn publish_payload(ctx: &EdgeSessionContext, message_type: &str, topic: &str, payload: &serde_json::Value) {
    match rmp_serde::to_vec(payload) {
        Ok(bytes) => {
            if let Err(e) = ctx.topics.publish(topic, &bytes).await {
                ctx.metrics
                    .messages_failed_total
                    .with_label_values(&[message_type, "topic_publish"])
                    .inc();
                tracing::warn!(error = %e, topic, "failed to publish to topic");
            }
        }
        Err(e) => {
            ctx.metrics
                .messages_failed_total
                .with_label_values(&[message_type, "encode"])
                .inc();
            tracing::warn!(error = %e, topic, "failed to encode payload for publish");
        }
    }
}

fn send_json<T: serde::Serialize>(tx: &mpsc::UnboundedSender<Message>, message: &T) {
    if let Ok(text) = serde_json::to_string(message) {
        let _ = tx.send(Message::Text(text.into()));
    }
}

fn close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &'static str) {
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    })));
}
