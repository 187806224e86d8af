//! Enrichment processor.
//!
//! Runs the detection capability over artifacts that are on disk but not yet
//! processed, and appends one [`DetectionRecord`] per detected object.
//!
//! Candidate set = artifacts on disk − processed artifacts, where the
//! processed set is re-read from the store each run (see
//! [`ArtifactTracker`]). Detection identifiers are derived from
//! `(media_path, detected_class, occurrence_index)`, so re-processing an
//! artifact reproduces the same identifiers and insert-or-ignore drops the
//! repeats.
//!
//! An artifact whose detector reports nothing leaves no detection record and
//! is therefore re-scanned on every run, unless
//! `enrichment.mark_empty_processed` is set, in which case an
//! `empty_artifacts` marker is written instead.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::artifacts::{self, ArtifactFile, ArtifactScanner};
use crate::channels::ChannelResolver;
use crate::config::{Config, EnrichmentConfig};
use crate::detect::Detector;
use crate::error::PipelineResult;
use crate::migrate;
use crate::models::{
    Anomaly, AnomalyKind, ArtifactDescriptor, Detection, DetectionRecord, EnrichSummary,
    RunCounts,
};
use crate::observer::{PipelineEvent, RunObserver};
use crate::policy::{UnitOfWork, WriteOutcome};
use crate::tracker::ArtifactTracker;

/// Candidate computation for one run, without invoking the detector.
#[derive(Debug, Default)]
pub struct EnrichPlan {
    pub on_disk: usize,
    pub already_processed: usize,
    pub candidates: Vec<ArtifactFile>,
    pub anomalies: Vec<Anomaly>,
}

/// An artifact processed with zero detections.
#[derive(Debug, Clone)]
struct EmptyMarker {
    media_path: String,
    checked_at: DateTime<Utc>,
}

pub struct Enricher {
    scanner: ArtifactScanner,
    tracker: ArtifactTracker,
    mark_empty_processed: bool,
    resolver: Arc<dyn ChannelResolver>,
    detector: Arc<dyn Detector>,
    observer: Arc<dyn RunObserver>,
}

impl Enricher {
    pub fn new(
        scanner: ArtifactScanner,
        settings: &EnrichmentConfig,
        resolver: Arc<dyn ChannelResolver>,
        detector: Arc<dyn Detector>,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self {
            scanner,
            tracker: ArtifactTracker::new(settings.mark_empty_processed),
            mark_empty_processed: settings.mark_empty_processed,
            resolver,
            detector,
            observer,
        }
    }

    pub fn from_config(
        config: &Config,
        resolver: Arc<dyn ChannelResolver>,
        detector: Arc<dyn Detector>,
        observer: Arc<dyn RunObserver>,
    ) -> anyhow::Result<Self> {
        let scanner = ArtifactScanner::new(config.paths.artifact_root.clone(), &config.enrichment)?;
        Ok(Self::new(
            scanner,
            &config.enrichment,
            resolver,
            detector,
            observer,
        ))
    }

    /// Scan the artifact directory and subtract the processed set.
    pub async fn plan(&self, pool: &SqlitePool) -> PipelineResult<EnrichPlan> {
        migrate::ensure_schema(pool).await?;
        let processed = self.tracker.processed(pool).await?;

        let scan = self.scanner.scan();
        let mut plan = EnrichPlan {
            anomalies: scan.anomalies,
            ..EnrichPlan::default()
        };
        if scan.root_missing {
            plan.anomalies.push(Anomaly::new(
                AnomalyKind::ScanFailure,
                self.scanner.root().display().to_string(),
                "artifact directory not found",
            ));
        }

        plan.on_disk = scan.files.len();
        for file in scan.files {
            if processed.contains(&file.media_path) {
                plan.already_processed += 1;
            } else {
                plan.candidates.push(file);
            }
        }

        Ok(plan)
    }

    /// Enrich every candidate and flush all detections in one unit.
    ///
    /// Detector failures skip the artifact; only store failures are raised.
    pub async fn run(&self, pool: &SqlitePool) -> PipelineResult<EnrichSummary> {
        let plan = self.plan(pool).await?;
        let mut summary = EnrichSummary::default();

        for anomaly in plan.anomalies {
            self.record(&mut summary.anomalies, anomaly);
        }

        summary.artifacts.on_disk = plan.on_disk as u64;
        summary.artifacts.already_processed = plan.already_processed as u64;
        summary.artifacts.candidates = plan.candidates.len() as u64;
        self.observer.observe(PipelineEvent::CandidatesComputed {
            on_disk: summary.artifacts.on_disk,
            processed: summary.artifacts.already_processed,
            candidates: summary.artifacts.candidates,
        });

        let mut records = Vec::new();
        let mut markers = Vec::new();

        for file in &plan.candidates {
            let descriptor = match artifacts::parse_artifact_name(&file.media_path) {
                Ok(d) => d,
                Err(detail) => {
                    summary.artifacts.skipped += 1;
                    self.record(
                        &mut summary.anomalies,
                        Anomaly::new(AnomalyKind::UnparseableName, &file.media_path, detail),
                    );
                    continue;
                }
            };

            let Some(channel_identifier) = self.resolver.resolve(&descriptor.channel_name) else {
                summary.artifacts.skipped += 1;
                self.record(
                    &mut summary.anomalies,
                    Anomaly::new(
                        AnomalyKind::UnknownChannel,
                        &file.media_path,
                        format!("no identifier for channel '{}'", descriptor.channel_name),
                    ),
                );
                continue;
            };

            let detections = match self.detector.detect(&file.path).await {
                Ok(d) => d,
                Err(err) => {
                    summary.artifacts.failed += 1;
                    self.record(
                        &mut summary.anomalies,
                        Anomaly::new(
                            AnomalyKind::CapabilityFailure,
                            &file.media_path,
                            format!("{:#}", err),
                        ),
                    );
                    continue;
                }
            };

            self.observer.observe(PipelineEvent::ArtifactDetected {
                media_path: file.media_path.clone(),
                detections: detections.len() as u64,
            });

            let now = Utc::now();
            if detections.is_empty() {
                summary.artifacts.without_detections += 1;
                if self.mark_empty_processed {
                    markers.push(EmptyMarker {
                        media_path: file.media_path.clone(),
                        checked_at: now,
                    });
                }
            } else {
                summary.artifacts.with_detections += 1;
                records.extend(build_records(
                    &descriptor,
                    &channel_identifier,
                    &detections,
                    now,
                ));
            }
        }

        let flushed = self.flush(pool, &records, &markers, &mut summary.anomalies).await?;
        summary.counts.absorb(flushed);
        Ok(summary)
    }

    /// Single batched write of the run's detections, tolerant of identifiers
    /// already stored by an earlier (possibly partial) run.
    async fn flush(
        &self,
        pool: &SqlitePool,
        records: &[DetectionRecord],
        markers: &[EmptyMarker],
        anomalies: &mut Vec<Anomaly>,
    ) -> PipelineResult<RunCounts> {
        let mut counts = RunCounts::default();
        if records.is_empty() && markers.is_empty() {
            return Ok(counts);
        }

        let mut unit = UnitOfWork::begin(pool, "detection_records").await?;

        for record in records {
            match unit.apply(insert_detection(record)).await {
                Ok(WriteOutcome::Inserted) => counts.inserted += 1,
                Ok(WriteOutcome::AlreadyExists) => counts.skipped += 1,
                Ok(WriteOutcome::Rejected(detail)) => {
                    counts.errored += 1;
                    self.record(
                        anomalies,
                        Anomaly::new(
                            AnomalyKind::ConstraintViolation,
                            format!("{} {}", record.media_path, record.detection_id),
                            detail,
                        ),
                    );
                }
                Err(err) => return Err(unit.abort(err).await),
            }
        }

        for marker in markers {
            match unit
                .apply(insert_marker(marker, self.detector.name()))
                .await
            {
                Ok(WriteOutcome::Rejected(detail)) => self.record(
                    anomalies,
                    Anomaly::new(
                        AnomalyKind::ConstraintViolation,
                        &marker.media_path,
                        detail,
                    ),
                ),
                Ok(_) => {}
                Err(err) => return Err(unit.abort(err).await),
            }
        }

        unit.commit().await?;
        self.observer
            .observe(PipelineEvent::DetectionsFlushed { counts });
        Ok(counts)
    }

    fn record(&self, anomalies: &mut Vec<Anomaly>, anomaly: Anomaly) {
        self.observer.observe(PipelineEvent::Anomaly(anomaly.clone()));
        anomalies.push(anomaly);
    }
}

/// Deterministic identifier for the `occurrence`-th object of `class` in an
/// artifact.
pub fn detection_id(media_path: &str, detected_class: &str, occurrence: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(media_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(detected_class.as_bytes());
    hasher.update([0u8]);
    hasher.update((occurrence as u64).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Turn one artifact's detections into records. Occurrence indexes count per
/// class in detector order; confidences are rounded to four decimals.
pub fn build_records(
    descriptor: &ArtifactDescriptor,
    channel_identifier: &str,
    detections: &[Detection],
    detected_at: DateTime<Utc>,
) -> Vec<DetectionRecord> {
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    detections
        .iter()
        .map(|d| {
            let slot = occurrences.entry(d.class_label.as_str()).or_insert(0);
            let occurrence = *slot;
            *slot += 1;
            DetectionRecord {
                detection_id: detection_id(&descriptor.media_path, &d.class_label, occurrence),
                source_id: descriptor.source_id,
                channel_identifier: channel_identifier.to_string(),
                media_path: descriptor.media_path.clone(),
                detected_class: d.class_label.clone(),
                confidence: (d.confidence * 10_000.0).round() / 10_000.0,
                detected_at,
            }
        })
        .collect()
}

fn insert_detection(record: &DetectionRecord) -> Query<'static, Sqlite, SqliteArguments<'static>> {
    sqlx::query(
        r#"
        INSERT INTO detection_records (
            detection_id, source_id, channel_identifier, media_path,
            detected_class, confidence_score, detected_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(detection_id) DO NOTHING
        "#,
    )
    .bind(record.detection_id.clone())
    .bind(record.source_id)
    .bind(record.channel_identifier.clone())
    .bind(record.media_path.clone())
    .bind(record.detected_class.clone())
    .bind(record.confidence)
    .bind(record.detected_at.timestamp())
}

fn insert_marker(
    marker: &EmptyMarker,
    detector: &str,
) -> Query<'static, Sqlite, SqliteArguments<'static>> {
    sqlx::query(
        "INSERT INTO empty_artifacts (media_path, detector, checked_at) VALUES (?, ?, ?) \
         ON CONFLICT(media_path) DO NOTHING",
    )
    .bind(marker.media_path.clone())
    .bind(detector.to_string())
    .bind(marker.checked_at.timestamp())
}
