//! Row types written by the persistence pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A new session, opened for the lifetime of one edge WebSocket connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub session_id: Uuid,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub device_info: serde_json::Value,
}

/// An append-only prediction record, queued for a batched write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub user_id: String,
    pub prediction_type: String,
    pub classifier_name: String,
    pub data: serde_json::Value,
    pub confidence: Option<f64>,
    pub classifier_version: Option<String>,
    pub processing_time_ms: Option<i64>,
}

/// An append-only raw-sample record, queued for a batched write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSampleRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub user_id: String,
    pub data: serde_json::Value,
}
