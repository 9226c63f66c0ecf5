// =============================================================================
// Application identity
// =============================================================================

pub const APP_NAME_LOWER: &str = "signalbridge";

// =============================================================================
// Environment variables - server
// =============================================================================

pub const ENV_HOST: &str = "BIND_HOST";
pub const ENV_PORT: &str = "BIND_PORT";
pub const ENV_LOG: &str = "LOG_LEVEL";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;

// =============================================================================
// Environment variables - upstream services
// =============================================================================

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_EDGE_API_KEY: &str = "EDGE_API_KEY";
pub const ENV_ENABLE_DB_PERSISTENCE: &str = "ENABLE_DB_PERSISTENCE";
pub const ENV_ENABLE_REDIS_PUBSUB: &str = "ENABLE_REDIS_PUBSUB";

// =============================================================================
// Stream buffer / persistence defaults
// =============================================================================

/// Default per-user stream buffer capacity (samples retained).
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Default persistence batch size before a size-triggered flush.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default persistence flush interval, in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

// =============================================================================
// Topic naming
// =============================================================================

/// Build the features topic name for a user: `user:{user_id}:features`.
pub fn features_topic(user_id: &str) -> String {
    format!("user:{user_id}:features")
}

/// Build the raw-sample topic name for a user: `user:{user_id}:raw`.
pub fn raw_topic(user_id: &str) -> String {
    format!("user:{user_id}:raw")
}

// =============================================================================
// Timeouts
// =============================================================================

/// Edge authentication must arrive within this many seconds of socket open.
pub const AUTH_TIMEOUT_SECS: u64 = 10;

/// Grace period allowed for in-flight handlers to drain during shutdown.
pub const SHUTDOWN_DRAIN_TIMEOUT_SECS: u64 = 10;

/// Broadcast channel capacity for newly created topics.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 10_000;
