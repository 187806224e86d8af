//! Store integrity overview.
//!
//! Summarises what has been ingested and enriched and flags the two states a
//! healthy store must not (duplicate detection ids) or should rarely
//! (detections without a matching raw record) contain. Used by
//! `scrapeline check` after a run.

use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, PipelineResult};
use crate::migrate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCounts {
    pub channel_identifier: String,
    pub raw_records: i64,
    pub detections: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanDetection {
    pub source_id: i64,
    pub channel_identifier: String,
    pub detections: i64,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub raw_records: i64,
    pub detections: i64,
    pub processed_artifacts: i64,
    pub empty_artifacts: i64,
    pub by_channel: Vec<ChannelCounts>,
    pub duplicate_detection_ids: Vec<(String, i64)>,
    pub orphans: Vec<OrphanDetection>,
}

impl IntegrityReport {
    /// Duplicates break the dedup invariant; orphans are informational.
    pub fn is_consistent(&self) -> bool {
        self.duplicate_detection_ids.is_empty()
    }
}

pub async fn integrity_report(pool: &SqlitePool) -> PipelineResult<IntegrityReport> {
    migrate::ensure_schema(pool).await?;
    build(pool).await.map_err(PipelineError::StoreUnavailable)
}

async fn build(pool: &SqlitePool) -> Result<IntegrityReport, sqlx::Error> {
    let raw_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_records")
        .fetch_one(pool)
        .await?;
    let detections: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM detection_records")
        .fetch_one(pool)
        .await?;
    let processed_artifacts: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT media_path) FROM detection_records")
            .fetch_one(pool)
            .await?;
    let empty_artifacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM empty_artifacts")
        .fetch_one(pool)
        .await?;

    let channel_rows = sqlx::query(
        r#"
        SELECT channel_identifier,
               SUM(raw_count) AS raw_count,
               SUM(det_count) AS det_count
        FROM (
            SELECT channel_identifier, COUNT(*) AS raw_count, 0 AS det_count
            FROM raw_records GROUP BY channel_identifier
            UNION ALL
            SELECT channel_identifier, 0 AS raw_count, COUNT(*) AS det_count
            FROM detection_records GROUP BY channel_identifier
        )
        GROUP BY channel_identifier
        ORDER BY channel_identifier
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_channel = channel_rows
        .iter()
        .map(|row| ChannelCounts {
            channel_identifier: row.get("channel_identifier"),
            raw_records: row.get("raw_count"),
            detections: row.get("det_count"),
        })
        .collect();

    let duplicate_rows = sqlx::query(
        "SELECT detection_id, COUNT(*) AS n FROM detection_records \
         GROUP BY detection_id HAVING COUNT(*) > 1",
    )
    .fetch_all(pool)
    .await?;
    let duplicate_detection_ids = duplicate_rows
        .iter()
        .map(|row| (row.get("detection_id"), row.get("n")))
        .collect();

    let orphan_rows = sqlx::query(
        r#"
        SELECT d.source_id, d.channel_identifier, COUNT(*) AS n
        FROM detection_records d
        LEFT JOIN raw_records r
            ON d.source_id = r.source_id AND d.channel_identifier = r.channel_identifier
        WHERE r.source_id IS NULL
        GROUP BY d.source_id, d.channel_identifier
        ORDER BY d.channel_identifier, d.source_id
        "#,
    )
    .fetch_all(pool)
    .await?;
    let orphans = orphan_rows
        .iter()
        .map(|row| OrphanDetection {
            source_id: row.get("source_id"),
            channel_identifier: row.get("channel_identifier"),
            detections: row.get("n"),
        })
        .collect();

    Ok(IntegrityReport {
        raw_records,
        detections,
        processed_artifacts,
        empty_artifacts,
        by_channel,
        duplicate_detection_ids,
        orphans,
    })
}
