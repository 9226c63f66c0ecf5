//! Topic backend trait: broadcast-only pub/sub used for fan-out to consumers.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::error::TopicError;

/// Subscription to a topic: a stream of raw payloads.
pub struct BroadcastSubscription {
    pub receiver: Pin<Box<dyn Stream<Item = Result<Vec<u8>, TopicError>> + Send>>,
}

/// Fan-out backend for feature/raw-sample topics.
///
/// Delivery is best-effort: if no subscribers are attached when `publish` is
/// called, the message is dropped. Slow subscribers may lag and miss
/// messages rather than stall the publisher.
#[async_trait]
pub trait TopicBackend: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TopicError>;

    async fn subscribe(&self, topic: &str) -> Result<BroadcastSubscription, TopicError>;

    /// Validate the backend is reachable (e.g. Redis PING).
    async fn health_check(&self) -> Result<(), TopicError>;

    fn backend_name(&self) -> &'static str;

    /// Release backend resources (bridge tasks, connections). No-op by default.
    async fn shutdown(&self) {}
}
