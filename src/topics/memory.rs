//! In-process topic backend. Suitable for single-instance deployments and tests;
//! messages do not survive a process restart and are not visible to other processes.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::constants::DEFAULT_BROADCAST_CAPACITY;

use super::backend::{BroadcastSubscription, TopicBackend};
use super::error::TopicError;

struct SharedState {
    channels: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    capacity: usize,
}

#[derive(Clone)]
pub struct MemoryTopicBackend {
    state: Arc<SharedState>,
}

impl Default for MemoryTopicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTopicBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(SharedState {
                channels: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    fn get_or_create(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        {
            let channels = self.state.channels.read();
            if let Some(sender) = channels.get(topic) {
                return sender.clone();
            }
        }

        let mut channels = self.state.channels.write();
        if let Some(sender) = channels.get(topic) {
            return sender.clone();
        }

        let (sender, _) = broadcast::channel(self.state.capacity);
        channels.insert(topic.to_string(), sender.clone());
        sender
    }
}

#[async_trait]
impl TopicBackend for MemoryTopicBackend {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TopicError> {
        let sender = self.get_or_create(topic);
        // No receivers is not an error: fire-and-forget semantics.
        let _ = sender.send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BroadcastSubscription, TopicError> {
        let sender = self.get_or_create(topic);
        let mut receiver = sender.subscribe();

        let stream = stream! {
            loop {
                match receiver.recv().await {
                    Ok(payload) => yield Ok(payload),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(TopicError::Lagged(n));
                    }
                }
            }
        };

        Ok(BroadcastSubscription {
            receiver: Box::pin(stream),
        })
    }

    async fn health_check(&self) -> Result<(), TopicError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let backend = MemoryTopicBackend::new();
        let mut sub = backend.subscribe("topic-a").await.unwrap();

        backend.publish("topic-a", b"hello").await.unwrap();

        let msg = sub.receiver.next().await.unwrap().unwrap();
        assert_eq!(msg, b"hello");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let backend = MemoryTopicBackend::new();
        assert!(backend.publish("ghost-topic", b"x").await.is_ok());
    }

    #[tokio::test]
    async fn distinct_topics_are_isolated() {
        let backend = MemoryTopicBackend::new();
        let mut sub_a = backend.subscribe("a").await.unwrap();
        let mut sub_b = backend.subscribe("b").await.unwrap();

        backend.publish("a", b"only-a").await.unwrap();

        let msg = sub_a.receiver.next().await.unwrap().unwrap();
        assert_eq!(msg, b"only-a");

        // b should not have anything queued; give it a moment then check via timeout
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sub_b.receiver.next(),
        )
        .await;
        assert!(result.is_err(), "topic b should not have received a's message");
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_lagged_error() {
        let backend = MemoryTopicBackend::with_capacity(2);
        let mut sub = backend.subscribe("small").await.unwrap();

        for i in 0..10u8 {
            backend.publish("small", &[i]).await.unwrap();
        }

        let mut saw_lagged = false;
        while let Some(item) = sub.receiver.next().await {
            if let Err(TopicError::Lagged(_)) = item {
                saw_lagged = true;
                break;
            }
        }
        assert!(saw_lagged);
    }
}
