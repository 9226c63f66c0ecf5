//! Centralized shutdown coordination.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::constants::SHUTDOWN_DRAIN_TIMEOUT_SECS;
use crate::persistence::PersistencePipeline;
use crate::topics::TopicService;

/// Coordinates graceful shutdown across background tasks and owned transports.
#[derive(Clone)]
pub struct ShutdownService {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    topics: Arc<TopicService>,
    persistence: Arc<PersistencePipeline>,
}

impl ShutdownService {
    pub fn new(topics: Arc<TopicService>, persistence: Arc<PersistencePipeline>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            handles: Arc::new(Mutex::new(Vec::new())),
            topics,
            persistence,
        }
    }

    /// Register a background task handle to be awaited during shutdown.
    pub async fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Trigger shutdown without waiting for completion.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Trigger shutdown and drain everything in dependency order:
    /// stop accepting work, drain background tasks, stop persistence
    /// (final flush), close transport handles.
    pub async fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown");
        self.trigger();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        let task_count = handles.len();
        tracing::debug!(count = task_count, "waiting for background tasks to drain");

        let timeout = Duration::from_secs(SHUTDOWN_DRAIN_TIMEOUT_SECS);
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(timeout_secs = timeout.as_secs(), "timed out draining background tasks");
        }

        tracing::debug!("stopping persistence pipeline (final flush)");
        self.persistence.stop().await;

        tracing::debug!("shutting down topic backend");
        self.topics.shutdown().await;

        tracing::info!("shutdown complete");
    }

    /// Future that resolves once shutdown has been triggered, for use with
    /// axum's graceful-shutdown hook.
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|&v| v).await;
        }
    }

    /// Install OS signal handlers (Ctrl+C, SIGTERM) that trigger shutdown.
    pub fn install_signal_handlers(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
                _ = terminate => tracing::info!("received SIGTERM, shutting down"),
            }

            service.trigger();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_shutdown() -> ShutdownService {
        let topics = Arc::new(TopicService::memory());
        let metrics = Arc::new(crate::metrics::Metrics::new().unwrap());
        let persistence = Arc::new(PersistencePipeline::new_disabled(metrics));
        ShutdownService::new(topics, persistence)
    }

    #[tokio::test]
    async fn not_triggered_initially() {
        let shutdown = make_shutdown();
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn trigger_sets_flag() {
        let shutdown = make_shutdown();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn subscriber_observes_trigger() {
        let shutdown = make_shutdown();
        let rx = shutdown.subscribe();
        assert!(!*rx.borrow());
        shutdown.trigger();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let shutdown = make_shutdown();
        let wait_future = shutdown.wait();
        let handle = tokio::spawn(wait_future);
        tokio::task::yield_now().await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_awaits_registered_handles() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let shutdown = make_shutdown();
        let completed = Arc::new(AtomicBool::new(false));
        let completed_clone = completed.clone();
        let handle = tokio::spawn(async move {
            completed_clone.store(true, Ordering::SeqCst);
        });
        shutdown.register(handle).await;

        shutdown.shutdown().await;
        assert!(completed.load(Ordering::SeqCst));
    }
}
