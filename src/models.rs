//! Core data types that flow through ingestion and enrichment.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// One ingested unit, keyed by `(source_id, channel_identifier)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub source_id: i64,
    pub channel_name: String,
    pub channel_identifier: String,
    pub collected_date: NaiveDate,
    /// Source-asserted time, normalised to RFC 3339 UTC.
    pub source_date: Option<DateTime<Utc>>,
    pub text: String,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub has_media: bool,
    pub media_path: Option<String>,
}

impl RawRecord {
    pub fn text_length(&self) -> i64 {
        self.text.chars().count() as i64
    }

    /// Natural key rendered for logs and anomaly reports.
    pub fn key(&self) -> String {
        format!("({}, {})", self.source_id, self.channel_identifier)
    }
}

/// A media file discovered on disk whose name follows
/// `{channel_name}_{source_id}[_{date}].{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Path relative to the artifact root, `/`-separated. Stored as `media_path`.
    pub media_path: String,
    pub channel_name: String,
    pub source_id: i64,
    pub date: Option<NaiveDate>,
}

/// One object reported by the detection capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_label: String,
    pub confidence: f64,
}

/// One detected object instance within one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub detection_id: String,
    pub source_id: i64,
    pub channel_identifier: String,
    pub media_path: String,
    pub detected_class: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

/// Per-unit write counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub inserted: u64,
    pub skipped: u64,
    pub errored: u64,
}

impl RunCounts {
    pub fn absorb(&mut self, other: RunCounts) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.errored += other.errored;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Batch payload missing required fields or carrying wrong types.
    MalformedPayload,
    /// Batch file unreadable or not a JSON array.
    InvalidBatch,
    /// Integrity violation other than the expected duplicate key.
    ConstraintViolation,
    /// Artifact filename does not follow the naming convention.
    UnparseableName,
    /// Channel name has no identifier mapping.
    UnknownChannel,
    /// Detection capability failed on an artifact.
    CapabilityFailure,
    /// Directory entry could not be read during a scan.
    ScanFailure,
}

/// A recorded, non-fatal problem with one unit (record, file or artifact).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub unit: String,
    pub detail: String,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, unit: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            unit: unit.into(),
            detail: detail.into(),
        }
    }
}

/// Result of one ingest run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub batches: u64,
    pub counts: RunCounts,
    pub anomalies: Vec<Anomaly>,
}

/// Artifact-level tallies of one enrich run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactCounts {
    pub on_disk: u64,
    pub already_processed: u64,
    pub candidates: u64,
    pub with_detections: u64,
    pub without_detections: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Result of one enrich run.
///
/// `counts` are detection-record writes only. Per-artifact outcomes (skipped
/// names or channels, detector failures) are tallied in `artifacts`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichSummary {
    pub artifacts: ArtifactCounts,
    pub counts: RunCounts,
    pub anomalies: Vec<Anomaly>,
}
