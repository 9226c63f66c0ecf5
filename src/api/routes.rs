//! REST handlers: health checks, buffer queries, aggregate stats, metrics scrape.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::buffer::{BufferStats, Sample, SampleFilter, SampleKind};
use crate::error::AppError;
use crate::registry::RegistryStats;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub redis: &'static str,
    pub database: &'static str,
}

pub async fn ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, AppError> {
    state
        .topics
        .health_check()
        .await
        .map_err(|e| AppError::Unavailable(format!("pub/sub unreachable: {e}")))?;
    state
        .persistence
        .health_check()
        .await
        .map_err(|e| AppError::Unavailable(format!("database unreachable: {e}")))?;

    Ok(Json(ReadyResponse {
        status: "ready",
        redis: "connected",
        database: "connected",
    }))
}

#[derive(Deserialize)]
pub struct SampleTypeQuery {
    #[serde(default = "default_sample_type")]
    pub sample_type: String,
}

fn default_sample_type() -> String {
    "features".to_string()
}

fn parse_kind(sample_type: &str) -> Option<SampleKind> {
    match sample_type {
        "features" => Some(SampleKind::Features),
        "raw" => Some(SampleKind::Raw),
        _ => None,
    }
}

pub async fn buffer_latest(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<SampleTypeQuery>,
) -> Result<Json<Sample>, AppError> {
    let Some(buffer) = state.buffers.get(&user_id) else {
        return Err(AppError::NotFound("user buffer not found".to_string()));
    };
    let filter = SampleFilter {
        user_id: Some(user_id.as_str()),
        kind: parse_kind(&query.sample_type),
    };
    buffer
        .latest(filter)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no data in buffer".to_string()))
}

pub async fn buffer_last_n(
    State(state): State<AppState>,
    Path((user_id, n)): Path<(String, usize)>,
    Query(query): Query<SampleTypeQuery>,
) -> Result<Json<Vec<Sample>>, AppError> {
    let Some(buffer) = state.buffers.get(&user_id) else {
        return Err(AppError::NotFound("user buffer not found".to_string()));
    };
    let filter = SampleFilter {
        user_id: Some(user_id.as_str()),
        kind: parse_kind(&query.sample_type),
    };
    Ok(Json(buffer.last_n(n, filter)))
}

pub async fn buffer_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<BufferStats>, AppError> {
    let Some(buffer) = state.buffers.get(&user_id) else {
        return Err(AppError::NotFound("user buffer not found".to_string()));
    };
    Ok(Json(buffer.stats()))
}

#[derive(Deserialize)]
pub struct RangeQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_sample_type")]
    pub sample_type: String,
}

pub async fn buffer_range(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<Sample>>, AppError> {
    let Some(buffer) = state.buffers.get(&user_id) else {
        return Err(AppError::NotFound("user buffer not found".to_string()));
    };
    let filter = SampleFilter {
        user_id: Some(user_id.as_str()),
        kind: parse_kind(&query.sample_type),
    };
    Ok(Json(buffer.range(query.start, query.end, filter)))
}

/// Drop every sample this user currently has buffered. Does not touch
/// durably persisted data, only the in-memory query ring.
pub async fn buffer_clear(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let Some(buffer) = state.buffers.get(&user_id) else {
        return Err(AppError::NotFound("user buffer not found".to_string()));
    };
    buffer.clear(Some(user_id.as_str()));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct PersistenceStats {
    pub enabled: bool,
    pub predictions_queued: usize,
    pub raw_samples_queued: usize,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub connections: RegistryStats,
    pub persistence: PersistenceStats,
    pub buffers: HashMap<String, BufferStats>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.connections.stats(),
        persistence: PersistenceStats {
            enabled: state.persistence.is_enabled(),
            predictions_queued: state.persistence.predictions_queue_len().await,
            raw_samples_queued: state.persistence.raw_samples_queue_len().await,
        },
        buffers: state.buffers.stats_by_user(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn parse_kind_accepts_features_and_raw() {
        assert_eq!(parse_kind("features"), Some(SampleKind::Features));
        assert_eq!(parse_kind("raw"), Some(SampleKind::Raw));
    }

    #[test]
    fn parse_kind_rejects_unknown_value() {
        assert_eq!(parse_kind("bogus"), None);
    }

    #[test]
    fn sample_type_query_defaults_to_features() {
        let query: SampleTypeQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.sample_type, "features");
    }

    fn make_state() -> AppState {
        let metrics = Arc::new(crate::metrics::Metrics::new().unwrap());
        let topics = Arc::new(crate::topics::TopicService::memory());
        let persistence = Arc::new(crate::persistence::PersistencePipeline::new_disabled(
            metrics.clone(),
        ));
        AppState {
            buffers: Arc::new(crate::buffer::BufferRegistry::new(10)),
            connections: Arc::new(crate::registry::ConnectionRegistry::new()),
            shutdown: crate::shutdown::ShutdownService::new(topics.clone(), persistence.clone()),
            topics,
            persistence,
            metrics,
            edge_api_key: "k".to_string(),
            enable_redis_pubsub: false,
        }
    }

    #[tokio::test]
    async fn buffer_latest_for_unknown_user_is_not_found() {
        let state = make_state();
        let result = buffer_latest(
            State(state),
            Path("ghost".to_string()),
            Query(SampleTypeQuery {
                sample_type: "features".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn ready_reports_ready_when_no_backing_stores_configured() {
        let state = make_state();
        let result = ready(State(state)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stats_reflects_empty_registries() {
        let state = make_state();
        let Json(response) = stats(State(state)).await;
        assert_eq!(response.connections.active_edge_connections, 0);
        assert!(response.buffers.is_empty());
    }

    #[tokio::test]
    async fn buffer_range_for_unknown_user_is_not_found() {
        let state = make_state();
        let now = Utc::now();
        let result = buffer_range(
            State(state),
            Path("ghost".to_string()),
            Query(RangeQuery {
                start: now,
                end: now,
                sample_type: "features".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn buffer_range_returns_matches_within_window() {
        let state = make_state();
        let buffer = state.buffers.ensure("u1");
        let t0 = Utc::now();
        buffer.append(Sample {
            timestamp: t0,
            session_id: uuid::Uuid::new_v4(),
            user_id: "u1".to_string(),
            kind: SampleKind::Features,
            data: serde_json::json!({"value": 1}),
            metadata: serde_json::Value::Null,
        });

        let Json(samples) = buffer_range(
            State(state),
            Path("u1".to_string()),
            Query(RangeQuery {
                start: t0,
                end: t0,
                sample_type: "features".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn buffer_clear_for_unknown_user_is_not_found() {
        let state = make_state();
        let result = buffer_clear(State(state), Path("ghost".to_string())).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn buffer_clear_empties_the_users_buffer() {
        let state = make_state();
        let buffer = state.buffers.ensure("u1");
        buffer.append(Sample {
            timestamp: Utc::now(),
            session_id: uuid::Uuid::new_v4(),
            user_id: "u1".to_string(),
            kind: SampleKind::Features,
            data: serde_json::json!({}),
            metadata: serde_json::Value::Null,
        });

        let status = buffer_clear(State(state.clone()), Path("u1".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.buffers.get("u1").unwrap().stats().total_samples == 0);
    }
}
