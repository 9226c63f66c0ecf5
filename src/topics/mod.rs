//! Pub/sub fan-out for feature and raw-sample topics, backed by either an
//! in-process broadcast channel or Redis Pub/Sub depending on configuration.

pub mod backend;
pub mod error;
pub mod memory;
pub mod redis;

pub use backend::{BroadcastSubscription, TopicBackend};
pub use error::TopicError;
pub use memory::MemoryTopicBackend;
pub use redis::RedisTopicBackend;

use std::sync::Arc;

/// Thin, concrete facade over a [`TopicBackend`] trait object, used by the rest
/// of the application so call sites never need to know which backend is active.
pub struct TopicService {
    backend: Arc<dyn TopicBackend>,
}

impl TopicService {
    pub fn new(backend: Arc<dyn TopicBackend>) -> Self {
        Self { backend }
    }

    /// Construct a service backed by the in-process broadcast backend.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryTopicBackend::new()))
    }

    pub async fn redis(redis_url: &str) -> Result<Self, TopicError> {
        let backend = RedisTopicBackend::new(redis_url).await?;
        Ok(Self::new(Arc::new(backend)))
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TopicError> {
        self.backend.publish(topic, payload).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<BroadcastSubscription, TopicError> {
        self.backend.subscribe(topic).await
    }

    pub async fn health_check(&self) -> Result<(), TopicError> {
        self.backend.health_check().await
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Release backend resources (bridge tasks for Redis; a no-op for memory).
    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn memory_service_round_trips_a_message() {
        let service = TopicService::memory();
        let mut sub = service.subscribe("t").await.unwrap();
        service.publish("t", b"ping").await.unwrap();
        let msg = sub.receiver.next().await.unwrap().unwrap();
        assert_eq!(msg, b"ping");
    }

    #[tokio::test]
    async fn memory_service_health_check_always_ok() {
        let service = TopicService::memory();
        assert!(service.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_on_memory_backend_is_a_no_op() {
        let service = TopicService::memory();
        service.shutdown().await;
        assert!(service.publish("t", b"x").await.is_ok());
    }
}
