//! A FIFO batching queue: accumulate records, flush in batches either when a
//! size threshold is hit or on a periodic tick. Failed flushes re-prepend
//! their batch to the front of the queue so retry preserves ordering.
//!
//! The queue has no capacity bound — a sustained sink outage grows it
//! unbounded rather than dropping data. TODO: a bounded queue with an
//! explicit drop policy would need a decision on what to drop (oldest vs.
//! newest) that isn't specified anywhere upstream.

use std::future::Future;

use tokio::sync::Mutex;

/// Generic batching queue over record type `T`. `flush_fn` performs the
/// actual write and is supplied by the caller so this type stays storage-agnostic.
pub struct PersistenceQueue<T> {
    buffer: Mutex<Vec<T>>,
    flush_lock: Mutex<()>,
    batch_size: usize,
}

impl<T: Send + 'static> PersistenceQueue<T> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            batch_size,
        }
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append a record. Returns `true` if the caller should trigger an
    /// immediate flush (buffer reached the batch-size threshold).
    pub async fn push(&self, record: T) -> bool {
        let mut buf = self.buffer.lock().await;
        buf.push(record);
        buf.len() >= self.batch_size
    }

    /// Detach the current buffer contents and hand them to `write`. On
    /// success the records are dropped; on failure `write` hands the batch
    /// back (alongside the error) and it is re-prepended to the front of the
    /// queue so a later retry preserves arrival order.
    ///
    /// An in-flight flush short-circuits concurrent calls: if the flush lock
    /// is already held, this call is a no-op rather than blocking, since the
    /// in-progress flush will pick up anything enqueued meanwhile on its next run.
    pub async fn flush<F, Fut, E>(&self, write: F) -> Result<usize, E>
    where
        F: FnOnce(Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), (E, Vec<T>)>>,
    {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return Ok(0);
        };

        let batch = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *buf)
        };

        let count = batch.len();
        match write(batch).await {
            Ok(()) => Ok(count),
            Err((e, batch)) => {
                let mut buf = self.buffer.lock().await;
                let mut restored = batch;
                restored.extend(std::mem::take(&mut *buf));
                *buf = restored;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn push_reports_threshold_reached() {
        let queue: PersistenceQueue<i32> = PersistenceQueue::new(3);
        assert!(!queue.push(1).await);
        assert!(!queue.push(2).await);
        assert!(queue.push(3).await);
    }

    #[tokio::test]
    async fn flush_empties_queue_on_success() {
        let queue: PersistenceQueue<i32> = PersistenceQueue::new(10);
        queue.push(1).await;
        queue.push(2).await;

        let written = Arc::new(AtomicUsize::new(0));
        let written_clone = Arc::clone(&written);
        let result: Result<usize, ()> = queue
            .flush(|batch| async move {
                written_clone.store(batch.len(), Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(written.load(Ordering::SeqCst), 2);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn failed_flush_reprepends_to_front() {
        let queue: PersistenceQueue<i32> = PersistenceQueue::new(10);
        queue.push(1).await;
        queue.push(2).await;

        let result: Result<usize, &str> =
            queue.flush(|batch| async move { Err(("boom", batch)) }).await;
        assert!(result.is_err());

        // New arrival while the failed batch was in flight.
        queue.push(3).await;

        let buf = queue.buffer.lock().await;
        assert_eq!(*buf, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn flush_on_empty_queue_is_noop() {
        let queue: PersistenceQueue<i32> = PersistenceQueue::new(10);
        let result: Result<usize, ()> = queue.flush(|_batch| async move { Ok(()) }).await;
        assert_eq!(result.unwrap(), 0);
    }
}
