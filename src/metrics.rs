//! Prometheus metrics surface, scraped at `/metrics`. Names and label sets
//! mirror the original ingestion server's metric definitions exactly so
//! existing dashboards and alerts keep working unmodified.

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramVec, Opts, Registry,
    core::{AtomicF64, GenericGauge},
};

pub struct Metrics {
    registry: Registry,
    pub app_info: GaugeVec,
    pub edge_relay_connections: Gauge,
    pub consumer_connections: Gauge,
    pub messages_received_total: CounterVec,
    pub messages_processed_total: CounterVec,
    pub messages_failed_total: CounterVec,
    pub buffer_size: GaugeVec,
    pub buffer_capacity: GaugeVec,
    pub db_writes_total: CounterVec,
    pub db_write_duration_seconds: HistogramVec,
    pub db_batch_size: HistogramVec,
    pub pending_writes: GaugeVec,
    pub sample_latency_seconds: HistogramVec,
    pub active_sessions: Gauge,
    pub sessions_created_total: prometheus::Counter,
    pub sessions_ended_total: prometheus::Counter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        // `prometheus` (Rust) has no native Info metric type; the conventional
        // stand-in is a gauge fixed at 1, labeled with the info fields.
        let app_info = GaugeVec::new(
            Opts::new("app_info", "Signal broker build information"),
            &["version"],
        )?;
        let edge_relay_connections = Gauge::with_opts(Opts::new(
            "edge_relay_connections",
            "Number of active edge relay connections",
        ))?;
        let consumer_connections = Gauge::with_opts(Opts::new(
            "consumer_connections",
            "Number of active consumer connections",
        ))?;
        let messages_received_total = CounterVec::new(
            Opts::new("messages_received_total", "Total number of messages received"),
            &["message_type", "user_id"],
        )?;
        let messages_processed_total = CounterVec::new(
            Opts::new(
                "messages_processed_total",
                "Total number of messages successfully processed",
            ),
            &["message_type"],
        )?;
        let messages_failed_total = CounterVec::new(
            Opts::new(
                "messages_failed_total",
                "Total number of messages that failed processing",
            ),
            &["message_type", "error_type"],
        )?;
        let buffer_size = GaugeVec::new(
            Opts::new("buffer_size", "Number of samples in buffer"),
            &["user_id"],
        )?;
        let buffer_capacity = GaugeVec::new(
            Opts::new("buffer_capacity", "Maximum buffer capacity"),
            &["user_id"],
        )?;
        let db_writes_total = CounterVec::new(
            Opts::new("db_writes_total", "Total number of database writes"),
            &["table"],
        )?;
        let db_write_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "db_write_duration_seconds",
                "Duration of database write operations",
            ),
            &["table"],
        )?;
        let db_batch_size = HistogramVec::new(
            prometheus::HistogramOpts::new("db_batch_size", "Size of database write batches"),
            &["table"],
        )?;
        let pending_writes = GaugeVec::new(
            Opts::new("pending_writes", "Number of records pending database write"),
            &["table"],
        )?;
        let sample_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "sample_latency_seconds",
                "Latency from edge relay timestamp to server receipt",
            ),
            &["sample_type"],
        )?;
        let active_sessions = Gauge::with_opts(Opts::new(
            "active_sessions",
            "Number of active sessions",
        ))?;
        let sessions_created_total = prometheus::Counter::with_opts(Opts::new(
            "sessions_created_total",
            "Total number of sessions created",
        ))?;
        let sessions_ended_total = prometheus::Counter::with_opts(Opts::new(
            "sessions_ended_total",
            "Total number of sessions ended",
        ))?;

        registry.register(Box::new(app_info.clone()))?;
        app_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1.0);

        registry.register(Box::new(edge_relay_connections.clone()))?;
        registry.register(Box::new(consumer_connections.clone()))?;
        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(buffer_size.clone()))?;
        registry.register(Box::new(buffer_capacity.clone()))?;
        registry.register(Box::new(db_writes_total.clone()))?;
        registry.register(Box::new(db_write_duration_seconds.clone()))?;
        registry.register(Box::new(db_batch_size.clone()))?;
        registry.register(Box::new(pending_writes.clone()))?;
        registry.register(Box::new(sample_latency_seconds.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(sessions_created_total.clone()))?;
        registry.register(Box::new(sessions_ended_total.clone()))?;

        Ok(Self {
            registry,
            app_info,
            edge_relay_connections,
            consumer_connections,
            messages_received_total,
            messages_processed_total,
            messages_failed_total,
            buffer_size,
            buffer_capacity,
            db_writes_total,
            db_write_duration_seconds,
            db_batch_size,
            pending_writes,
            sample_latency_seconds,
            active_sessions,
            sessions_created_total,
            sessions_ended_total,
        })
    }

    /// Render the current state of every registered metric in Prometheus text format.
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buf) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn buffer_gauge(&self, user_id: &str) -> GenericGauge<AtomicF64> {
        self.buffer_size.with_label_values(&[user_id])
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metric registration cannot fail with fixed, non-conflicting names")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_every_metric_name() {
        let metrics = Metrics::new().unwrap();
        metrics.edge_relay_connections.set(1.0);
        metrics
            .messages_received_total
            .with_label_values(&["features", "u1"])
            .inc();

        let text = metrics.render();
        assert!(text.contains("edge_relay_connections"));
        assert!(text.contains("messages_received_total"));
        assert!(text.contains("active_sessions"));
    }

    #[test]
    fn labeled_metrics_are_independent_per_label_set() {
        let metrics = Metrics::new().unwrap();
        metrics.buffer_size.with_label_values(&["u1"]).set(5.0);
        metrics.buffer_size.with_label_values(&["u2"]).set(9.0);

        assert_eq!(metrics.buffer_size.with_label_values(&["u1"]).get(), 5.0);
        assert_eq!(metrics.buffer_size.with_label_values(&["u2"]).get(), 9.0);
    }
}
