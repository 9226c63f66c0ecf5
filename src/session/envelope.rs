//! Wire envelope types shared by the edge and consumer session handlers.
//!
//! Edge frames arrive as either MessagePack (binary) or JSON (text); both
//! decode to the same logical shape, so the dispatch code never needs to
//! know which encoding a given frame used.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// First frame sent by an edge device after the socket opens.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthFrame {
    pub api_key: String,
    pub user_id: String,
    #[serde(default)]
    pub device_info: serde_json::Value,
}

/// Tag distinguishing subsequent edge frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Features,
    Raw,
    Heartbeat,
    #[serde(other)]
    Unknown,
}

/// An edge frame after the envelope tag has been peeled off; remaining
/// fields are kept as a raw JSON object so feature/raw payloads stay
/// schema-agnostic past the `type` tag, per the wire contract.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

/// Decode an edge frame from either MessagePack bytes (binary frame) or JSON text.
pub fn decode_edge_frame_binary(bytes: &[u8]) -> Result<EdgeFrame, DecodeError> {
    rmp_serde::from_slice(bytes).map_err(|e| DecodeError::MessagePack(e.to_string()))
}

pub fn decode_edge_frame_text(text: &str) -> Result<EdgeFrame, DecodeError> {
    serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid messagepack frame: {0}")]
    MessagePack(String),
    #[error("invalid json frame: {0}")]
    Json(String),
}

/// Server → edge acknowledgement sent once authentication succeeds.
#[derive(Debug, Clone, Serialize)]
pub struct AuthAck {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub session_id: Uuid,
}

impl AuthAck {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            frame_type: "auth_ack",
            session_id,
        }
    }
}

/// Server → edge acknowledgement sent in response to a heartbeat frame.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatAck {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
}

impl Default for HeartbeatAck {
    fn default() -> Self {
        Self {
            frame_type: "heartbeat_ack",
        }
    }
}

/// Inbound message from a consumer. Only `type == "prediction"` is acted on;
/// any other value is dropped by the caller. Also re-serialized verbatim when
/// forwarded to the edge relay, so the wire shape is preserved end to end.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub prediction_type: Option<String>,
    #[serde(default)]
    pub classifier_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub version: Option<String>,
    /// Top-level confidence, preferred over `data.confidence` when both are present.
    #[serde(default)]
    pub confidence: Option<f64>,
}

pub const DEFAULT_PREDICTION_TYPE: &str = "azure_ml";
pub const DEFAULT_CLASSIFIER_NAME: &str = "azure_unknown";

impl ConsumerMessage {
    pub fn is_prediction(&self) -> bool {
        self.message_type == "prediction"
    }

    /// Confidence, preferring the top-level field and falling back to
    /// `data.confidence` — the open question this spec resolves in favor of
    /// top-level precedence.
    pub fn resolved_confidence(&self) -> Option<f64> {
        self.confidence
            .or_else(|| self.data.get("confidence").and_then(|v| v.as_f64()))
    }

    pub fn resolved_prediction_type(&self) -> String {
        self.prediction_type
            .clone()
            .unwrap_or_else(|| DEFAULT_PREDICTION_TYPE.to_string())
    }

    pub fn resolved_classifier_name(&self) -> String {
        self.classifier_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CLASSIFIER_NAME.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_defaults_device_info_to_null() {
        let frame: AuthFrame =
            serde_json::from_str(r#"{"api_key":"k","user_id":"u1"}"#).unwrap();
        assert!(frame.device_info.is_null());
    }

    #[test]
    fn edge_frame_text_roundtrip() {
        let frame = decode_edge_frame_text(r#"{"type":"features","workload":0.7}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Features);
        assert_eq!(frame.payload["workload"], 0.7);
    }

    #[test]
    fn unknown_frame_type_decodes_as_unknown_not_error() {
        let frame = decode_edge_frame_text(r#"{"type":"bogus"}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Unknown);
    }

    #[test]
    fn binary_frame_roundtrips_through_msgpack() {
        let original = decode_edge_frame_text(r#"{"type":"raw","channel":[1,2,3]}"#).unwrap();
        let encoded = rmp_serde::to_vec(&serde_json::json!({"type": "raw", "channel": [1,2,3]}))
            .unwrap();
        let decoded = decode_edge_frame_binary(&encoded).unwrap();
        assert_eq!(decoded.frame_type, original.frame_type);
        assert_eq!(decoded.payload["channel"], original.payload["channel"]);
    }

    #[test]
    fn confidence_prefers_top_level_over_data() {
        let msg: ConsumerMessage = serde_json::from_str(
            r#"{"type":"prediction","confidence":0.9,"data":{"confidence":0.1}}"#,
        )
        .unwrap();
        assert_eq!(msg.resolved_confidence(), Some(0.9));
    }

    #[test]
    fn confidence_falls_back_to_data_field() {
        let msg: ConsumerMessage = serde_json::from_str(
            r#"{"type":"prediction","data":{"confidence":0.4}}"#,
        )
        .unwrap();
        assert_eq!(msg.resolved_confidence(), Some(0.4));
    }

    #[test]
    fn prediction_defaults_applied_when_absent() {
        let msg: ConsumerMessage =
            serde_json::from_str(r#"{"type":"prediction","data":{}}"#).unwrap();
        assert_eq!(msg.resolved_prediction_type(), DEFAULT_PREDICTION_TYPE);
        assert_eq!(msg.resolved_classifier_name(), DEFAULT_CLASSIFIER_NAME);
    }

    #[test]
    fn non_prediction_message_type_is_flagged() {
        let msg: ConsumerMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(!msg.is_prediction());
    }
}
