//! Redis-backed topic backend: bridges Redis Pub/Sub into the same
//! broadcast-stream abstraction the in-memory backend exposes, so session
//! handlers never need to know which backend is active.
//!
//! One bridge task per topic (not per subscriber): the task owns a dedicated
//! Redis connection, subscribes once, and forwards every message onto a local
//! `tokio::sync::broadcast` channel. `publish` always goes to Redis only,
//! never directly to the local channel, so same-process publishers and
//! subscribers don't see duplicate deliveries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::constants::DEFAULT_BROADCAST_CAPACITY;

use super::backend::{BroadcastSubscription, TopicBackend};
use super::error::TopicError;

const PUBSUB_PREFIX: &str = "signalbridge:pubsub:";
const PUBSUB_RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Bridge {
    sender: broadcast::Sender<Vec<u8>>,
    subscriber_count: AtomicU64,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Bridge {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            sender,
            subscriber_count: AtomicU64::new(0),
            task_handle: Mutex::new(None),
            stop_tx,
            stop_rx,
        }
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

pub struct RedisTopicBackend {
    pool: Pool,
    redis_url: String,
    bridges: RwLock<HashMap<String, Arc<Bridge>>>,
    broadcast_capacity: usize,
}

impl RedisTopicBackend {
    pub async fn new(redis_url: &str) -> Result<Self, TopicError> {
        let mut config = Config::from_url(redis_url);
        config.pool = Some(deadpool_redis::PoolConfig {
            max_size: 32,
            timeouts: deadpool_redis::Timeouts {
                wait: Some(Duration::from_secs(5)),
                create: Some(Duration::from_secs(5)),
                recycle: Some(Duration::from_secs(5)),
            },
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| TopicError::Connection(format!("failed to create redis pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| TopicError::Connection(format!("failed to reach redis: {e}")))?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| TopicError::Connection(format!("redis PING failed: {e}")))?;

        Ok(Self {
            pool,
            redis_url: redis_url.to_string(),
            bridges: RwLock::new(HashMap::new()),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        })
    }

    fn pubsub_channel(&self, topic: &str) -> String {
        format!("{PUBSUB_PREFIX}{topic}")
    }

    fn get_or_create_bridge(&self, topic: &str) -> (Arc<Bridge>, bool) {
        {
            let bridges = self.bridges.read();
            if let Some(bridge) = bridges.get(topic) {
                return (Arc::clone(bridge), false);
            }
        }

        let mut bridges = self.bridges.write();
        if let Some(bridge) = bridges.get(topic) {
            return (Arc::clone(bridge), false);
        }

        let bridge = Arc::new(Bridge::new(self.broadcast_capacity));
        bridges.insert(topic.to_string(), Arc::clone(&bridge));
        (bridge, true)
    }

    fn start_bridge_task(&self, topic: &str, bridge: Arc<Bridge>) {
        let channel = self.pubsub_channel(topic);
        let redis_url = self.redis_url.clone();
        let handle = tokio::spawn(Self::run_bridge_task(redis_url, channel, Arc::clone(&bridge)));
        *bridge.task_handle.lock() = Some(handle);
    }

    async fn run_bridge_task(redis_url: String, channel: String, bridge: Arc<Bridge>) {
        let mut stop_rx = bridge.stop_rx.clone();

        'outer: loop {
            if *stop_rx.borrow() {
                break;
            }

            let client = match deadpool_redis::redis::Client::open(redis_url.as_str()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, channel = %channel, "failed to create redis client for pub/sub, retrying");
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(PUBSUB_RECONNECT_DELAY) => continue,
                    }
                }
            };

            let mut pubsub = match client.get_async_pubsub().await {
                Ok(ps) => ps,
                Err(e) => {
                    tracing::warn!(error = %e, channel = %channel, "failed to get pub/sub connection, retrying");
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(PUBSUB_RECONNECT_DELAY) => continue,
                    }
                }
            };

            if let Err(e) = pubsub.subscribe(&channel).await {
                tracing::warn!(error = %e, channel = %channel, "failed to subscribe, retrying");
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(PUBSUB_RECONNECT_DELAY) => continue,
                }
            }

            tracing::debug!(channel = %channel, "redis pub/sub bridge connected");
            let mut msg_stream = pubsub.on_message();

            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break 'outer;
                        }
                    }

                    msg_opt = msg_stream.next() => {
                        match msg_opt {
                            Some(msg) => {
                                let payload: Vec<u8> = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        tracing::warn!(error = %e, channel = %channel, "failed to decode pub/sub payload");
                                        continue;
                                    }
                                };
                                let _ = bridge.sender.send(payload);
                            }
                            None => {
                                tracing::warn!(channel = %channel, "redis pub/sub stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(PUBSUB_RECONNECT_DELAY) => {}
            }
        }

        tracing::debug!(channel = %channel, "redis pub/sub bridge stopped");
    }

    pub async fn shutdown(&self) {
        let bridges: Vec<Arc<Bridge>> = self.bridges.read().values().cloned().collect();
        for bridge in &bridges {
            bridge.stop();
        }
        for bridge in bridges {
            let handle = bridge.task_handle.lock().take();
            if let Some(h) = handle {
                let _ = tokio::time::timeout(Duration::from_secs(5), h).await;
            }
        }
        self.bridges.write().clear();
    }
}

#[async_trait]
impl TopicBackend for RedisTopicBackend {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TopicError> {
        let channel = self.pubsub_channel(topic);
        let mut conn = self.pool.get().await?;
        // PUBLISH to Redis only; local delivery happens via the bridge task so
        // same-process subscribers don't see every message twice.
        let _: i64 = deadpool_redis::redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BroadcastSubscription, TopicError> {
        let (bridge, is_new) = self.get_or_create_bridge(topic);
        if is_new {
            self.start_bridge_task(topic, Arc::clone(&bridge));
        }

        bridge.subscriber_count.fetch_add(1, Ordering::SeqCst);
        let mut receiver = bridge.sender.subscribe();

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
        let mut conn = self.pool.get().await?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn shutdown(&self) {
        RedisTopicBackend::shutdown(self).await;
    }
}
