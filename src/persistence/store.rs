//! PostgreSQL-backed store: hand-rolled versioned migrations plus batch
//! insert helpers used by the persistence queues.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use super::error::PersistenceError;
use super::records::{NewSession, PredictionRecord, RawSampleRecord};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id UUID PRIMARY KEY,
    user_id TEXT NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ,
    device_info JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, start_time DESC);

CREATE TABLE IF NOT EXISTS predictions (
    id BIGSERIAL,
    timestamp TIMESTAMPTZ NOT NULL,
    session_id UUID NOT NULL,
    user_id TEXT NOT NULL,
    prediction_type TEXT NOT NULL,
    classifier_name TEXT NOT NULL,
    data JSONB NOT NULL,
    confidence DOUBLE PRECISION,
    classifier_version TEXT,
    processing_time_ms BIGINT,
    PRIMARY KEY (timestamp, id)
);

CREATE INDEX IF NOT EXISTS idx_predictions_session_time ON predictions(session_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_predictions_user_time ON predictions(user_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS raw_samples (
    id BIGSERIAL,
    timestamp TIMESTAMPTZ NOT NULL,
    session_id UUID NOT NULL,
    user_id TEXT NOT NULL,
    data JSONB NOT NULL,
    PRIMARY KEY (timestamp, id)
);

CREATE INDEX IF NOT EXISTS idx_raw_samples_user_time ON raw_samples(user_id, timestamp DESC);
"#;

/// PostgreSQL connection pool plus schema management.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_session(&self, session: &NewSession) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO sessions (session_id, user_id, start_time, device_info)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(session.session_id)
        .bind(&session.user_id)
        .bind(session.start_time)
        .bind(&session.device_info)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set `end_time`. Idempotent: setting it twice simply overwrites the value.
    pub async fn end_session(
        &self,
        session_id: Uuid,
        end_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE sessions SET end_time = $1 WHERE session_id = $2")
            .bind(end_time)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_predictions(
        &self,
        records: &[PredictionRecord],
    ) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO predictions (timestamp, session_id, user_id, prediction_type, classifier_name, data, confidence, classifier_version, processing_time_ms) ",
        );
        builder.push_values(records, |mut b, record| {
            b.push_bind(record.timestamp)
                .push_bind(record.session_id)
                .push_bind(&record.user_id)
                .push_bind(&record.prediction_type)
                .push_bind(&record.classifier_name)
                .push_bind(&record.data)
                .push_bind(record.confidence)
                .push_bind(&record.classifier_version)
                .push_bind(record.processing_time_ms);
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_raw_samples(
        &self,
        records: &[RawSampleRecord],
    ) -> Result<(), PersistenceError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("INSERT INTO raw_samples (timestamp, session_id, user_id, data) ");
        builder.push_values(records, |mut b, record| {
            b.push_bind(record.timestamp)
                .push_bind(record.session_id)
                .push_bind(&record.user_id)
                .push_bind(&record.data);
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

async fn run_migrations(pool: &PgPool) -> Result<(), PersistenceError> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'schema_version')",
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        tracing::debug!(version = SCHEMA_VERSION, "applying initial schema");
        apply_initial_schema(pool).await?;
        return Ok(());
    }

    let current_version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    match current_version {
        None => apply_initial_schema(pool).await?,
        Some(v) if v > SCHEMA_VERSION => {
            tracing::warn!(
                db_version = v,
                app_version = SCHEMA_VERSION,
                "schema is newer than this build expects"
            );
        }
        Some(v) if v < SCHEMA_VERSION => {
            // No versioned migrations exist yet beyond the initial schema.
            return Err(PersistenceError::MigrationFailed {
                version: v + 1,
                name: "unknown".to_string(),
                error: format!("no migration defined to advance from version {v}"),
            });
        }
        _ => tracing::debug!(version = SCHEMA_VERSION, "schema up to date"),
    }

    Ok(())
}

async fn apply_initial_schema(pool: &PgPool) -> Result<(), PersistenceError> {
    sqlx::query(SCHEMA).execute(pool).await?;
    sqlx::query(
        "INSERT INTO schema_version (id, version, applied_at) VALUES (1, $1, now())
         ON CONFLICT (id) DO UPDATE SET version = $1, applied_at = now()",
    )
    .bind(SCHEMA_VERSION)
    .execute(pool)
    .await?;
    Ok(())
}
