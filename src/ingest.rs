//! Ingestion loader.
//!
//! Loads batch files into `raw_records` with insert-if-absent semantics keyed
//! by `(source_id, channel_identifier)`: the first write wins, later
//! ingestions of the same key are counted as `skipped`. Each batch file is one
//! [`UnitOfWork`]; malformed payloads and unexpected constraint conflicts skip
//! only the offending record.

use chrono::NaiveDate;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

use crate::batch::{self, BatchContents, BatchFile};
use crate::channels::ChannelResolver;
use crate::config::Config;
use crate::error::PipelineResult;
use crate::migrate;
use crate::models::{Anomaly, AnomalyKind, IngestSummary, RawRecord, RunCounts};
use crate::observer::{PipelineEvent, RunObserver};
use crate::policy::{UnitOfWork, WriteOutcome};

/// Counts and anomalies for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub counts: RunCounts,
    pub anomalies: Vec<Anomaly>,
}

pub struct Loader {
    batch_root: PathBuf,
    resolver: Arc<dyn ChannelResolver>,
    observer: Arc<dyn RunObserver>,
}

impl Loader {
    pub fn new(
        batch_root: impl Into<PathBuf>,
        resolver: Arc<dyn ChannelResolver>,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self {
            batch_root: batch_root.into(),
            resolver,
            observer,
        }
    }

    pub fn from_config(
        config: &Config,
        resolver: Arc<dyn ChannelResolver>,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self::new(config.paths.batch_root.clone(), resolver, observer)
    }

    /// Ingest every batch under the batch root (or one date's batches).
    ///
    /// Returns `Err` only for the fatal store class; batches committed before
    /// the failure stay committed.
    pub async fn run(
        &self,
        pool: &SqlitePool,
        date: Option<NaiveDate>,
    ) -> PipelineResult<IngestSummary> {
        migrate::ensure_schema(pool).await?;

        let listing = batch::discover(&self.batch_root, date);
        let mut summary = IngestSummary::default();

        for path in &listing.missing {
            self.observer.observe(PipelineEvent::BatchMissing {
                path: path.display().to_string(),
            });
        }
        for anomaly in listing.anomalies {
            summary.counts.errored += 1;
            self.record(&mut summary.anomalies, anomaly);
        }

        for file in &listing.files {
            let outcome = self.ingest_file(pool, file).await?;
            summary.batches += 1;
            summary.counts.absorb(outcome.counts);
            summary.anomalies.extend(outcome.anomalies);
        }

        Ok(summary)
    }

    /// Read and ingest one batch file. A missing or empty file is a no-op.
    pub async fn ingest_file(
        &self,
        pool: &SqlitePool,
        file: &BatchFile,
    ) -> PipelineResult<BatchOutcome> {
        match batch::read_batch(&file.path) {
            Ok(BatchContents::Missing) => {
                self.observer.observe(PipelineEvent::BatchMissing {
                    path: file.label(),
                });
                Ok(BatchOutcome::default())
            }
            Ok(BatchContents::Payloads(payloads)) if payloads.is_empty() => {
                self.observer.observe(PipelineEvent::BatchMissing {
                    path: file.label(),
                });
                Ok(BatchOutcome::default())
            }
            Ok(BatchContents::Payloads(payloads)) => self.ingest_batch(pool, file, &payloads).await,
            Err(detail) => {
                let mut outcome = BatchOutcome::default();
                outcome.counts.errored += 1;
                self.record(
                    &mut outcome.anomalies,
                    Anomaly::new(AnomalyKind::InvalidBatch, file.label(), detail),
                );
                Ok(outcome)
            }
        }
    }

    /// Upsert the payloads of one batch inside a single transaction.
    pub async fn ingest_batch(
        &self,
        pool: &SqlitePool,
        file: &BatchFile,
        payloads: &[Value],
    ) -> PipelineResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut unit = UnitOfWork::begin(pool, file.label()).await?;

        for (index, value) in payloads.iter().enumerate() {
            let record = match batch::parse_payload(value, file, self.resolver.as_ref()) {
                Ok(r) => r,
                Err(detail) => {
                    outcome.counts.skipped += 1;
                    self.record(
                        &mut outcome.anomalies,
                        Anomaly::new(
                            AnomalyKind::MalformedPayload,
                            format!("{}[{}]", file.label(), index),
                            detail,
                        ),
                    );
                    continue;
                }
            };

            let written = match unit.exists(record_exists(&record)).await {
                Ok(true) => Ok(WriteOutcome::AlreadyExists),
                Ok(false) => unit.apply(insert_record(&record)).await,
                Err(err) => Err(err),
            };
            match written {
                Ok(WriteOutcome::Inserted) => outcome.counts.inserted += 1,
                Ok(WriteOutcome::AlreadyExists) => outcome.counts.skipped += 1,
                Ok(WriteOutcome::Rejected(detail)) => {
                    outcome.counts.errored += 1;
                    self.record(
                        &mut outcome.anomalies,
                        Anomaly::new(
                            AnomalyKind::ConstraintViolation,
                            format!("{} {}", file.label(), record.key()),
                            detail,
                        ),
                    );
                }
                Err(err) => return Err(unit.abort(err).await),
            }
        }

        unit.commit().await?;
        self.observer.observe(PipelineEvent::BatchLoaded {
            path: file.label(),
            counts: outcome.counts,
        });
        Ok(outcome)
    }

    fn record(&self, anomalies: &mut Vec<Anomaly>, anomaly: Anomaly) {
        self.observer.observe(PipelineEvent::Anomaly(anomaly.clone()));
        anomalies.push(anomaly);
    }
}

/// First write wins: a stored key is never re-validated against a later payload.
fn record_exists(record: &RawRecord) -> Query<'static, Sqlite, SqliteArguments<'static>> {
    sqlx::query("SELECT 1 FROM raw_records WHERE source_id = ? AND channel_identifier = ?")
        .bind(record.source_id)
        .bind(record.channel_identifier.clone())
}

fn insert_record(record: &RawRecord) -> Query<'static, Sqlite, SqliteArguments<'static>> {
    sqlx::query(
        r#"
        INSERT INTO raw_records (
            source_id, channel_name, channel_identifier, collected_date, source_date,
            text, text_length, views, forwards, has_media, media_path
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_id, channel_identifier) DO NOTHING
        "#,
    )
    .bind(record.source_id)
    .bind(record.channel_name.clone())
    .bind(record.channel_identifier.clone())
    .bind(record.collected_date.format("%Y-%m-%d").to_string())
    .bind(record.source_date.map(|d| d.to_rfc3339()))
    .bind(record.text.clone())
    .bind(record.text_length())
    .bind(record.views)
    .bind(record.forwards)
    .bind(record.has_media)
    .bind(record.media_path.clone())
}
