//! Idempotent schema creation.
//!
//! [`ensure_schema`] runs at the start of every ingest and enrich run before
//! the first write, so a fresh store never needs a separate `init`.

use sqlx::SqlitePool;
use tracing::debug;

use crate::config::DbConfig;
use crate::db;
use crate::error::{PipelineError, PipelineResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS raw_records (
        source_id INTEGER NOT NULL,
        channel_name TEXT NOT NULL,
        channel_identifier TEXT NOT NULL,
        collected_date TEXT NOT NULL,
        source_date TEXT,
        text TEXT NOT NULL DEFAULT '',
        text_length INTEGER NOT NULL DEFAULT 0 CHECK (text_length >= 0),
        views INTEGER CHECK (views IS NULL OR views >= 0),
        forwards INTEGER CHECK (forwards IS NULL OR forwards >= 0),
        has_media INTEGER NOT NULL DEFAULT 0,
        media_path TEXT,
        PRIMARY KEY (source_id, channel_identifier)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS detection_records (
        detection_id TEXT PRIMARY KEY,
        source_id INTEGER NOT NULL,
        channel_identifier TEXT NOT NULL,
        media_path TEXT NOT NULL,
        detected_class TEXT NOT NULL,
        confidence_score REAL NOT NULL
            CHECK (confidence_score >= 0.0 AND confidence_score <= 1.0),
        detected_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS empty_artifacts (
        media_path TEXT PRIMARY KEY,
        detector TEXT NOT NULL,
        checked_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_detection_records_media_path ON detection_records(media_path)",
    "CREATE INDEX IF NOT EXISTS idx_detection_records_source ON detection_records(source_id, channel_identifier)",
    "CREATE INDEX IF NOT EXISTS idx_raw_records_collected_date ON raw_records(collected_date)",
];

/// Create all tables and indexes if absent. Safe to call on every run.
pub async fn ensure_schema(pool: &SqlitePool) -> PipelineResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(PipelineError::StoreUnavailable)?;
    }
    debug!("schema ensured");
    Ok(())
}

/// Open the store, ensure the schema, and close again (`scrapeline init`).
pub async fn run_migrations(config: &DbConfig) -> PipelineResult<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
