//! Bounded per-user in-memory ring of samples, queryable by consumers that
//! want the latest state without waiting on the persistence pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of data carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Features,
    Raw,
}

/// A single ingested sample, held only in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub user_id: String,
    pub kind: SampleKind,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Statistics snapshot over the current buffer contents.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub total_samples: usize,
    pub unique_users: usize,
    pub unique_sessions: usize,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
    pub buffer_capacity: usize,
    pub buffer_usage_percent: f64,
}

/// Optional filter applied to buffer queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleFilter<'a> {
    pub user_id: Option<&'a str>,
    pub kind: Option<SampleKind>,
}

impl Sample {
    fn matches(&self, filter: SampleFilter<'_>) -> bool {
        if let Some(user_id) = filter.user_id
            && self.user_id != user_id
        {
            return false;
        }
        if let Some(kind) = filter.kind
            && self.kind != kind
        {
            return false;
        }
        true
    }
}

/// Thread-safe circular buffer for real-time stream data. Stores the latest
/// `capacity` samples; append is O(1) amortized and evicts the oldest entry
/// once full. All operations acquire a single mutex — uncontended in the
/// common case of one edge producer and occasional readers.
pub struct StreamBuffer {
    capacity: usize,
    inner: Mutex<VecDeque<Sample>>,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Insert at the tail; drop the head first if already at capacity. Never fails.
    pub fn append(&self, sample: Sample) {
        let mut buf = self.inner.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(sample);
    }

    /// Most recent sample matching `filter`, if any.
    pub fn latest(&self, filter: SampleFilter<'_>) -> Option<Sample> {
        let buf = self.inner.lock();
        buf.iter().rev().find(|s| s.matches(filter)).cloned()
    }

    /// Up to `n` most-recent matches, newest-first. `n == 0` returns empty;
    /// `n` larger than the retained count returns everything available.
    pub fn last_n(&self, n: usize, filter: SampleFilter<'_>) -> Vec<Sample> {
        let buf = self.inner.lock();
        buf.iter()
            .rev()
            .filter(|s| s.matches(filter))
            .take(n)
            .cloned()
            .collect()
    }

    /// Inclusive time-window query, oldest-first. Timestamps are always
    /// stored tz-aware (UTC), so no normalization is needed here.
    pub fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: SampleFilter<'_>,
    ) -> Vec<Sample> {
        let buf = self.inner.lock();
        buf.iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end && s.matches(filter))
            .cloned()
            .collect()
    }

    /// Drop all samples, or only those belonging to `user_id` when given.
    pub fn clear(&self, user_id: Option<&str>) {
        let mut buf = self.inner.lock();
        match user_id {
            None => buf.clear(),
            Some(uid) => buf.retain(|s| s.user_id != uid),
        }
    }

    pub fn stats(&self) -> BufferStats {
        let buf = self.inner.lock();
        if buf.is_empty() {
            return BufferStats {
                total_samples: 0,
                unique_users: 0,
                unique_sessions: 0,
                oldest_timestamp: None,
                newest_timestamp: None,
                buffer_capacity: self.capacity,
                buffer_usage_percent: 0.0,
            };
        }

        let mut users = std::collections::HashSet::new();
        let mut sessions = std::collections::HashSet::new();
        for s in buf.iter() {
            users.insert(s.user_id.as_str());
            sessions.insert(s.session_id);
        }

        BufferStats {
            total_samples: buf.len(),
            unique_users: users.len(),
            unique_sessions: sessions.len(),
            oldest_timestamp: buf.front().map(|s| s.timestamp),
            newest_timestamp: buf.back().map(|s| s.timestamp),
            buffer_capacity: self.capacity,
            buffer_usage_percent: (buf.len() as f64 / self.capacity as f64) * 100.0,
        }
    }
}

/// Owns one `StreamBuffer` per user, created lazily on first edge
/// authentication and kept for the lifetime of the process — a user
/// reconnecting gets back the same buffer rather than a fresh one.
pub struct BufferRegistry {
    capacity: usize,
    buffers: RwLock<HashMap<String, Arc<StreamBuffer>>>,
}

impl BufferRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Return the buffer for `user_id`, creating it if this is the first
    /// time this user has been seen.
    pub fn ensure(&self, user_id: &str) -> Arc<StreamBuffer> {
        if let Some(buf) = self.buffers.read().get(user_id) {
            return Arc::clone(buf);
        }
        let mut buffers = self.buffers.write();
        Arc::clone(
            buffers
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(StreamBuffer::new(self.capacity))),
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up an existing buffer without creating one.
    pub fn get(&self, user_id: &str) -> Option<Arc<StreamBuffer>> {
        self.buffers.read().get(user_id).cloned()
    }

    pub fn stats_by_user(&self) -> HashMap<String, BufferStats> {
        self.buffers
            .read()
            .iter()
            .map(|(user_id, buf)| (user_id.clone(), buf.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user_id: &str, kind: SampleKind, value: i64) -> Sample {
        Sample {
            timestamp: Utc::now(),
            session_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            data: serde_json::json!({ "value": value }),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn append_evicts_oldest_when_full() {
        let buf = StreamBuffer::new(3);
        for i in 0..5 {
            buf.append(sample("u1", SampleKind::Features, i));
        }
        let all = buf.last_n(10, SampleFilter::default());
        assert_eq!(all.len(), 3);
        // newest-first: last appended (value 4) comes first
        assert_eq!(all[0].data["value"], 4);
        assert_eq!(all[2].data["value"], 2);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let buf = StreamBuffer::new(5);
        for i in 0..100 {
            buf.append(sample("u1", SampleKind::Features, i));
            assert!(buf.stats().total_samples <= 5);
        }
    }

    #[test]
    fn last_n_zero_returns_empty() {
        let buf = StreamBuffer::new(5);
        buf.append(sample("u1", SampleKind::Features, 1));
        assert!(buf.last_n(0, SampleFilter::default()).is_empty());
    }

    #[test]
    fn last_n_larger_than_retained_returns_everything() {
        let buf = StreamBuffer::new(10);
        buf.append(sample("u1", SampleKind::Features, 1));
        buf.append(sample("u1", SampleKind::Features, 2));
        assert_eq!(buf.last_n(100, SampleFilter::default()).len(), 2);
    }

    #[test]
    fn filter_by_user_and_kind() {
        let buf = StreamBuffer::new(10);
        buf.append(sample("u1", SampleKind::Features, 1));
        buf.append(sample("u2", SampleKind::Features, 2));
        buf.append(sample("u1", SampleKind::Raw, 3));

        let filter = SampleFilter {
            user_id: Some("u1"),
            kind: Some(SampleKind::Features),
        };
        let results = buf.last_n(10, filter);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data["value"], 1);
    }

    #[test]
    fn unknown_user_returns_empty_not_error() {
        let buf = StreamBuffer::new(10);
        buf.append(sample("u1", SampleKind::Features, 1));
        let filter = SampleFilter {
            user_id: Some("ghost"),
            kind: None,
        };
        assert!(buf.last_n(10, filter).is_empty());
        assert!(buf.latest(filter).is_none());
    }

    #[test]
    fn range_is_inclusive_and_oldest_first() {
        let buf = StreamBuffer::new(10);
        let t0 = Utc::now();
        let s1 = Sample {
            timestamp: t0,
            ..sample("u1", SampleKind::Features, 1)
        };
        let t1 = t0 + chrono::Duration::seconds(5);
        let s2 = Sample {
            timestamp: t1,
            ..sample("u1", SampleKind::Features, 2)
        };
        buf.append(s1);
        buf.append(s2);

        let results = buf.range(t0, t1, SampleFilter::default());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].data["value"], 1);
        assert_eq!(results[1].data["value"], 2);
    }

    #[test]
    fn range_on_empty_buffer_returns_empty() {
        let buf = StreamBuffer::new(10);
        assert!(
            buf.range(Utc::now(), Utc::now(), SampleFilter::default())
                .is_empty()
        );
    }

    #[test]
    fn clear_respects_user_filter() {
        let buf = StreamBuffer::new(10);
        buf.append(sample("u1", SampleKind::Features, 1));
        buf.append(sample("u2", SampleKind::Features, 2));
        buf.clear(Some("u1"));
        let remaining = buf.last_n(10, SampleFilter::default());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].user_id, "u2");
    }

    #[test]
    fn ensure_creates_buffer_once_and_reuses_it() {
        let registry = BufferRegistry::new(10);
        let first = registry.ensure("u1");
        first.append(sample("u1", SampleKind::Features, 1));

        let second = registry.ensure("u1");
        assert_eq!(second.last_n(10, SampleFilter::default()).len(), 1);
    }

    #[test]
    fn get_on_unknown_user_returns_none() {
        let registry = BufferRegistry::new(10);
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn stats_by_user_covers_every_created_buffer() {
        let registry = BufferRegistry::new(10);
        registry.ensure("u1").append(sample("u1", SampleKind::Features, 1));
        registry.ensure("u2").append(sample("u2", SampleKind::Features, 2));

        let stats = registry.stats_by_user();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["u1"].total_samples, 1);
    }
}
