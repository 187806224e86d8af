//! Ingestion loader behaviour against a real SQLite store.
//!
//! Covers replay safety (same batch twice, duplicates inside a batch,
//! first-write-wins across batches), per-record isolation of malformed
//! payloads and constraint violations, and the no-op handling of missing or
//! empty batch files.

use chrono::NaiveDate;
use scrapeline::channels::{ChannelResolver, StaticChannelMap};
use scrapeline::config::Config;
use scrapeline::db;
use scrapeline::error::PipelineError;
use scrapeline::ingest::Loader;
use scrapeline::models::AnomalyKind;
use scrapeline::observer::{PipelineEvent, RunObserver};
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RunObserver for RecordingObserver {
    fn observe(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingObserver {
    fn missing_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, PipelineEvent::BatchMissing { .. }))
            .count()
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let root = tmp.path();
    let content = format!(
        r#"
[db]
path = "{root}/store/scrapeline.sqlite"

[paths]
batch_root = "{root}/batches"
artifact_root = "{root}/images"

[channels]
Chemed = "@CheMed123"
TikvahPharma = "@tikvahpharma"
"#,
        root = root.display()
    );
    toml::from_str(&content).unwrap()
}

fn write_batch(config: &Config, date: &str, channel: &str, body: &str) {
    let dir = config.paths.batch_root.join(date);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}.json", channel)), body).unwrap();
}

fn loader(config: &Config, observer: Arc<dyn RunObserver>) -> Loader {
    let resolver: Arc<dyn ChannelResolver> =
        Arc::new(StaticChannelMap::new(config.channels.clone()));
    Loader::from_config(config, resolver, observer)
}

async fn raw_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM raw_records")
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn dump(pool: &SqlitePool) -> Vec<String> {
    sqlx::query(
        "SELECT source_id, channel_identifier, collected_date, text, views FROM raw_records \
         ORDER BY channel_identifier, source_id",
    )
    .fetch_all(pool)
    .await
    .unwrap()
    .iter()
    .map(|r| {
        format!(
            "{}|{}|{}|{}|{:?}",
            r.get::<i64, _>("source_id"),
            r.get::<String, _>("channel_identifier"),
            r.get::<String, _>("collected_date"),
            r.get::<String, _>("text"),
            r.get::<Option<i64>, _>("views"),
        )
    })
    .collect()
}

fn three_messages() -> String {
    json!([
        {"message_id": 1, "channel": "Chemed", "date": "2025-01-14T08:00:00+00:00",
         "text": "Amoxicillin available", "views": 120, "forwards": 3,
         "has_photo": true, "photo_path": "data/images/Chemed_1.jpg"},
        {"message_id": 2, "channel": "Chemed", "date": "2025-01-14T09:00:00+00:00",
         "text": null, "views": null, "forwards": null, "has_photo": false, "photo_path": null},
        {"message_id": 3, "channel": "Chemed", "date": "2025-01-14T10:00:00+00:00",
         "text": "Vitamin C", "views": 40, "forwards": 0, "has_photo": false, "photo_path": null}
    ])
    .to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn ingesting_same_batch_twice_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(&cfg, "2025-01-15", "Chemed", &three_messages());

    let pool = db::connect(&cfg.db).await.unwrap();
    let loader = loader(&cfg, Arc::new(RecordingObserver::default()));

    let first = loader.run(&pool, None).await.unwrap();
    assert_eq!(first.batches, 1);
    assert_eq!(first.counts.inserted, 3);
    assert_eq!(first.counts.skipped, 0);
    let snapshot = dump(&pool).await;

    let second = loader.run(&pool, None).await.unwrap();
    assert_eq!(second.counts.inserted, 0);
    assert_eq!(second.counts.skipped, 3);
    assert_eq!(second.counts.errored, 0);
    assert_eq!(dump(&pool).await, snapshot);
    assert_eq!(raw_count(&pool).await, 3);
}

#[tokio::test]
async fn duplicate_inside_one_batch_is_stored_once() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(
        &cfg,
        "2025-01-15",
        "A",
        &json!([{"id": 1, "channel": "A"}, {"id": 1, "channel": "A"}]).to_string(),
    );

    let pool = db::connect(&cfg.db).await.unwrap();
    let summary = loader(&cfg, Arc::new(RecordingObserver::default()))
        .run(&pool, None)
        .await
        .unwrap();

    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.skipped, 1);
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM raw_records WHERE source_id = 1 AND channel_identifier = 'A'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn one_malformed_record_does_not_fail_the_batch() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);

    let mut payloads: Vec<serde_json::Value> = (1..=10)
        .map(|i| json!({"message_id": i, "channel": "Chemed", "text": format!("post {}", i)}))
        .collect();
    payloads[6] = json!({"channel": "Chemed", "text": "no id"});
    write_batch(
        &cfg,
        "2025-01-15",
        "Chemed",
        &serde_json::Value::Array(payloads).to_string(),
    );

    let pool = db::connect(&cfg.db).await.unwrap();
    let summary = loader(&cfg, Arc::new(RecordingObserver::default()))
        .run(&pool, None)
        .await
        .unwrap();

    assert_eq!(summary.counts.inserted, 9);
    assert_eq!(summary.counts.skipped, 1);
    assert_eq!(summary.anomalies.len(), 1);
    assert_eq!(summary.anomalies[0].kind, AnomalyKind::MalformedPayload);
    assert!(summary.anomalies[0].unit.ends_with("[6]"));
    assert_eq!(raw_count(&pool).await, 9);
}

#[tokio::test]
async fn constraint_violation_skips_only_that_record() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(
        &cfg,
        "2025-01-15",
        "Chemed",
        &json!([
            {"message_id": 1, "channel": "Chemed", "views": 10},
            {"message_id": 2, "channel": "Chemed", "views": -5},
            {"message_id": 3, "channel": "Chemed", "forwards": 2}
        ])
        .to_string(),
    );

    let pool = db::connect(&cfg.db).await.unwrap();
    let summary = loader(&cfg, Arc::new(RecordingObserver::default()))
        .run(&pool, None)
        .await
        .unwrap();

    assert_eq!(summary.counts.inserted, 2);
    assert_eq!(summary.counts.errored, 1);
    assert_eq!(summary.anomalies[0].kind, AnomalyKind::ConstraintViolation);
    assert!(summary.anomalies[0].unit.contains("(2, @CheMed123)"));

    let ids: Vec<i64> = sqlx::query_scalar("SELECT source_id FROM raw_records ORDER BY source_id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn disjoint_batches_sum_regardless_of_order_or_repetition() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(
        &cfg,
        "2025-01-14",
        "Chemed",
        &json!([{"id": 1}, {"id": 2}, {"id": 3}]).to_string(),
    );
    write_batch(
        &cfg,
        "2025-01-15",
        "TikvahPharma",
        &json!([{"id": 1}, {"id": 2}]).to_string(),
    );
    write_batch(
        &cfg,
        "2025-01-16",
        "Chemed",
        &json!([{"id": 4}]).to_string(),
    );

    let pool = db::connect(&cfg.db).await.unwrap();
    let loader = loader(&cfg, Arc::new(RecordingObserver::default()));

    for date in ["2025-01-16", "2025-01-14", "2025-01-16", "2025-01-15"] {
        let d = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        loader.run(&pool, Some(d)).await.unwrap();
    }
    loader.run(&pool, None).await.unwrap();

    assert_eq!(raw_count(&pool).await, 6);
    let identifiers: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT channel_identifier FROM raw_records ORDER BY channel_identifier",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(identifiers, vec!["@CheMed123", "@tikvahpharma"]);
}

#[tokio::test]
async fn first_write_wins_across_batches() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(
        &cfg,
        "2025-01-14",
        "Chemed",
        &json!([{"id": 7, "text": "original", "views": 10}]).to_string(),
    );
    write_batch(
        &cfg,
        "2025-01-15",
        "Chemed",
        &json!([{"id": 7, "text": "edited", "views": 99}]).to_string(),
    );

    let pool = db::connect(&cfg.db).await.unwrap();
    let summary = loader(&cfg, Arc::new(RecordingObserver::default()))
        .run(&pool, None)
        .await
        .unwrap();
    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.skipped, 1);

    let row = sqlx::query("SELECT text, views, collected_date FROM raw_records WHERE source_id = 7")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("text"), "original");
    assert_eq!(row.get::<i64, _>("views"), 10);
    assert_eq!(row.get::<String, _>("collected_date"), "2025-01-14");
}

#[tokio::test]
async fn replay_of_stored_key_with_invalid_counters_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(
        &cfg,
        "2025-01-14",
        "A",
        &json!([{"id": 1, "channel": "A", "views": 5}]).to_string(),
    );
    write_batch(
        &cfg,
        "2025-01-15",
        "A",
        &json!([{"id": 1, "channel": "A", "views": -1, "forwards": -3}]).to_string(),
    );

    let pool = db::connect(&cfg.db).await.unwrap();
    let summary = loader(&cfg, Arc::new(RecordingObserver::default()))
        .run(&pool, None)
        .await
        .unwrap();

    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.skipped, 1);
    assert_eq!(summary.counts.errored, 0);
    assert!(summary.anomalies.is_empty());

    let views: i64 = sqlx::query_scalar("SELECT views FROM raw_records WHERE source_id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(views, 5);
}

#[tokio::test]
async fn missing_and_empty_batches_are_noops() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let pool = db::connect(&cfg.db).await.unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let loader = loader(&cfg, observer.clone());

    // No batch root at all.
    let summary = loader.run(&pool, None).await.unwrap();
    assert_eq!(summary.batches, 0);
    assert_eq!(summary.counts, Default::default());
    assert_eq!(observer.missing_count(), 1);

    // Empty file and empty array.
    write_batch(&cfg, "2025-01-15", "Chemed", "");
    write_batch(&cfg, "2025-01-15", "TikvahPharma", "[]");
    let summary = loader.run(&pool, None).await.unwrap();
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.counts, Default::default());
    assert!(summary.anomalies.is_empty());
    assert_eq!(observer.missing_count(), 3);

    // A date with no directory.
    let absent = NaiveDate::from_ymd_opt(2020, 1, 1);
    let summary = loader.run(&pool, absent).await.unwrap();
    assert_eq!(summary.batches, 0);
    assert_eq!(observer.missing_count(), 4);
    assert_eq!(raw_count(&pool).await, 0);
}

#[tokio::test]
async fn invalid_batch_file_does_not_stop_the_run() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(&cfg, "2025-01-15", "Chemed", r#"{"not": "an array"}"#);
    write_batch(
        &cfg,
        "2025-01-15",
        "TikvahPharma",
        &json!([{"id": 1}]).to_string(),
    );

    let pool = db::connect(&cfg.db).await.unwrap();
    let summary = loader(&cfg, Arc::new(RecordingObserver::default()))
        .run(&pool, None)
        .await
        .unwrap();

    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.errored, 1);
    assert_eq!(summary.anomalies[0].kind, AnomalyKind::InvalidBatch);
}

#[tokio::test]
async fn unreachable_store_is_a_typed_failure() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, "a file, not a directory").unwrap();
    cfg.db.path = Path::new(&blocker).join("scrapeline.sqlite");

    let err = db::connect(&cfg.db).await.unwrap_err();
    assert!(matches!(err, PipelineError::StorePath { .. }));
    assert!(err.to_string().contains("canonical store unavailable"));
}

#[tokio::test]
async fn closed_pool_aborts_the_run() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    write_batch(&cfg, "2025-01-15", "Chemed", &three_messages());

    let pool = db::connect(&cfg.db).await.unwrap();
    pool.close().await;

    let err = loader(&cfg, Arc::new(RecordingObserver::default()))
        .run(&pool, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::StoreUnavailable(_)));
}
