//! Batched time-series persistence: two independent queues (predictions, raw
//! samples), each flushed on a periodic tick or as soon as it reaches its
//! batch-size threshold, whichever comes first.

pub mod error;
pub mod queue;
pub mod records;
pub mod store;

pub use error::PersistenceError;
pub use records::{NewSession, PredictionRecord, RawSampleRecord};
pub use store::PostgresStore;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics::Metrics;
use queue::PersistenceQueue;

const PREDICTIONS_TABLE: &str = "predictions";
const RAW_SAMPLES_TABLE: &str = "raw_samples";

/// Coordinates the prediction and raw-sample queues against an optional
/// database store. When no store is configured (persistence disabled),
/// enqueue and flush operations are accepted and simply discarded — callers
/// don't need to branch on whether persistence is turned on.
pub struct PersistencePipeline {
    store: Option<Arc<PostgresStore>>,
    predictions: PersistenceQueue<PredictionRecord>,
    raw_samples: PersistenceQueue<RawSampleRecord>,
    flush_interval: Duration,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
}

impl PersistencePipeline {
    pub fn new(
        store: Arc<PostgresStore>,
        batch_size: usize,
        flush_interval_secs: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            store: Some(store),
            predictions: PersistenceQueue::new(batch_size),
            raw_samples: PersistenceQueue::new(batch_size),
            flush_interval: Duration::from_secs(flush_interval_secs),
            flush_task: Mutex::new(None),
            stop_tx,
            stop_rx,
            metrics,
        }
    }

    /// Construct a pipeline with persistence disabled: enqueues are accepted
    /// and dropped, `start`/`stop` are no-ops beyond signaling.
    pub fn new_disabled(metrics: Arc<Metrics>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            store: None,
            predictions: PersistenceQueue::new(usize::MAX),
            raw_samples: PersistenceQueue::new(usize::MAX),
            flush_interval: Duration::from_secs(u64::MAX / 2),
            flush_task: Mutex::new(None),
            stop_tx,
            stop_rx,
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Spawn the periodic flush task. Idempotent: calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }

        let mut guard = match self.flush_task.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.is_some() {
            return;
        }

        let pipeline = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        let interval = self.flush_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        pipeline.flush_all().await;
                    }
                }
            }
        });

        *guard = Some(handle);
    }

    /// Stop the periodic flush task and perform one final flush of anything
    /// still queued. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);

        let handle = self.flush_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.flush_all().await;

        if let Some(store) = &self.store {
            store.close().await;
        }
    }

    pub async fn add_prediction(&self, record: PredictionRecord) {
        if !self.is_enabled() {
            return;
        }
        let should_flush = self.predictions.push(record).await;
        self.report_pending(PREDICTIONS_TABLE, self.predictions.len().await);
        if should_flush {
            self.flush_predictions().await;
        }
    }

    pub async fn add_raw_sample(&self, record: RawSampleRecord) {
        if !self.is_enabled() {
            return;
        }
        let should_flush = self.raw_samples.push(record).await;
        self.report_pending(RAW_SAMPLES_TABLE, self.raw_samples.len().await);
        if should_flush {
            self.flush_raw_samples().await;
        }
    }

    fn report_pending(&self, table: &str, len: usize) {
        self.metrics
            .pending_writes
            .with_label_values(&[table])
            .set(len as f64);
    }

    pub async fn flush_all(&self) {
        self.flush_predictions().await;
        self.flush_raw_samples().await;
    }

    async fn flush_predictions(&self) {
        if self.predictions.is_empty().await {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let started = Instant::now();
        let result = self
            .predictions
            .flush(|batch| async move {
                match store.insert_predictions(&batch).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err((e, batch)),
                }
            })
            .await;
        match result {
            Ok(count) => self.report_flush(PREDICTIONS_TABLE, count, started.elapsed()),
            Err(e) => tracing::warn!(error = %e, "failed to flush predictions batch, will retry"),
        }
        self.report_pending(PREDICTIONS_TABLE, self.predictions.len().await);
    }

    async fn flush_raw_samples(&self) {
        if self.raw_samples.is_empty().await {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let started = Instant::now();
        let result = self
            .raw_samples
            .flush(|batch| async move {
                match store.insert_raw_samples(&batch).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err((e, batch)),
                }
            })
            .await;
        match result {
            Ok(count) => self.report_flush(RAW_SAMPLES_TABLE, count, started.elapsed()),
            Err(e) => tracing::warn!(error = %e, "failed to flush raw sample batch, will retry"),
        }
        self.report_pending(RAW_SAMPLES_TABLE, self.raw_samples.len().await);
    }

    /// Record write counters and batch-size/duration histograms for a successful flush.
    /// A `count` of zero means the queue was empty and nothing was written.
    fn report_flush(&self, table: &str, count: usize, elapsed: Duration) {
        if count == 0 {
            return;
        }
        self.metrics
            .db_writes_total
            .with_label_values(&[table])
            .inc_by(count as f64);
        self.metrics
            .db_batch_size
            .with_label_values(&[table])
            .observe(count as f64);
        self.metrics
            .db_write_duration_seconds
            .with_label_values(&[table])
            .observe(elapsed.as_secs_f64());
    }

    pub async fn predictions_queue_len(&self) -> usize {
        self.predictions.len().await
    }

    pub async fn raw_samples_queue_len(&self) -> usize {
        self.raw_samples.len().await
    }

    pub async fn health_check(&self) -> Result<(), PersistenceError> {
        match &self.store {
            Some(store) => store.health_check().await,
            None => Ok(()),
        }
    }

    pub async fn open_session(&self, session: &NewSession) -> Result<(), PersistenceError> {
        match &self.store {
            Some(store) => store.insert_session(session).await,
            None => Ok(()),
        }
    }

    pub async fn close_session(
        &self,
        session_id: Uuid,
        end_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), PersistenceError> {
        match &self.store {
            Some(store) => store.end_session(session_id, end_time).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn disabled_pipeline_accepts_and_drops_writes() {
        let pipeline = PersistencePipeline::new_disabled(test_metrics());
        pipeline
            .add_prediction(PredictionRecord {
                timestamp: chrono::Utc::now(),
                session_id: Uuid::new_v4(),
                user_id: "u1".into(),
                prediction_type: "azure_ml".into(),
                classifier_name: "azure_unknown".into(),
                data: serde_json::json!({}),
                confidence: None,
                classifier_version: None,
                processing_time_ms: None,
            })
            .await;
        assert_eq!(pipeline.predictions_queue_len().await, 0);
    }

    #[tokio::test]
    async fn disabled_pipeline_health_check_is_ok() {
        let pipeline = PersistencePipeline::new_disabled(test_metrics());
        assert!(pipeline.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn disabled_pipeline_stop_is_harmless() {
        let pipeline = PersistencePipeline::new_disabled(test_metrics());
        pipeline.stop().await;
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn disabled_pipeline_session_ops_are_ok() {
        let pipeline = PersistencePipeline::new_disabled(test_metrics());
        let session = NewSession {
            session_id: Uuid::new_v4(),
            user_id: "u1".into(),
            start_time: chrono::Utc::now(),
            device_info: serde_json::json!({}),
        };
        assert!(pipeline.open_session(&session).await.is_ok());
        assert!(
            pipeline
                .close_session(session.session_id, chrono::Utc::now())
                .await
                .is_ok()
        );
    }
}
