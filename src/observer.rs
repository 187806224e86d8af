//! Run observability.
//!
//! Components never log through a global handle for run events; they report
//! typed [`PipelineEvent`]s to an injected [`RunObserver`]. The binary picks
//! an implementation with `--events`:
//!
//! - `log`: structured `tracing` events (default)
//! - `json`: one JSON object per line on **stderr**, so stdout stays parseable
//! - `off`: nothing

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::models::{Anomaly, AnomalyKind, RunCounts};

/// A single observable event from a run.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        stage: String,
    },
    StageFinished {
        stage: String,
        status: String,
        elapsed_ms: u64,
    },
    /// A batch file or date directory was absent; treated as a no-op.
    BatchMissing {
        path: String,
    },
    BatchLoaded {
        path: String,
        counts: RunCounts,
    },
    Anomaly(Anomaly),
    CandidatesComputed {
        on_disk: u64,
        processed: u64,
        candidates: u64,
    },
    ArtifactDetected {
        media_path: String,
        detections: u64,
    },
    DetectionsFlushed {
        counts: RunCounts,
    },
}

/// Receives run events. Called from the ingest, enrich and pipeline code.
pub trait RunObserver: Send + Sync {
    fn observe(&self, event: PipelineEvent);
}

/// Forwards events to `tracing`.
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn observe(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { stage } => info!(%stage, "stage started"),
            PipelineEvent::StageFinished {
                stage,
                status,
                elapsed_ms,
            } => info!(%stage, %status, elapsed_ms, "stage finished"),
            PipelineEvent::BatchMissing { path } => {
                info!(%path, "no batch data found, skipping")
            }
            PipelineEvent::BatchLoaded { path, counts } => info!(
                %path,
                inserted = counts.inserted,
                skipped = counts.skipped,
                errored = counts.errored,
                "batch loaded"
            ),
            PipelineEvent::Anomaly(anomaly) => match anomaly.kind {
                AnomalyKind::ConstraintViolation
                | AnomalyKind::CapabilityFailure
                | AnomalyKind::InvalidBatch => error!(
                    kind = ?anomaly.kind,
                    unit = %anomaly.unit,
                    detail = %anomaly.detail,
                    "unit skipped"
                ),
                _ => warn!(
                    kind = ?anomaly.kind,
                    unit = %anomaly.unit,
                    detail = %anomaly.detail,
                    "unit skipped"
                ),
            },
            PipelineEvent::CandidatesComputed {
                on_disk,
                processed,
                candidates,
            } => info!(on_disk, processed, candidates, "candidate set computed"),
            PipelineEvent::ArtifactDetected {
                media_path,
                detections,
            } => {
                if detections == 0 {
                    info!(%media_path, "no objects detected");
                } else {
                    info!(%media_path, detections, "artifact processed");
                }
            }
            PipelineEvent::DetectionsFlushed { counts } => info!(
                inserted = counts.inserted,
                skipped = counts.skipped,
                errored = counts.errored,
                "detections flushed"
            ),
        }
    }
}

/// Machine-readable events: one JSON object per line on stderr.
pub struct JsonObserver;

impl RunObserver for JsonObserver {
    fn observe(&self, event: PipelineEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op observer.
pub struct NoObserver;

impl RunObserver for NoObserver {
    fn observe(&self, _event: PipelineEvent) {}
}

/// Observer selection for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ObserverMode {
    Log,
    Json,
    Off,
}

impl ObserverMode {
    pub fn observer(&self) -> Arc<dyn RunObserver> {
        match self {
            ObserverMode::Log => Arc::new(LogObserver),
            ObserverMode::Json => Arc::new(JsonObserver),
            ObserverMode::Off => Arc::new(NoObserver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = PipelineEvent::CandidatesComputed {
            on_disk: 3,
            processed: 1,
            candidates: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "candidates_computed");
        assert_eq!(json["candidates"], 2);

        let anomaly = PipelineEvent::Anomaly(Anomaly::new(
            AnomalyKind::UnknownChannel,
            "Other_1.jpg",
            "no identifier for channel 'Other'",
        ));
        let json = serde_json::to_value(&anomaly).unwrap();
        assert_eq!(json["event"], "anomaly");
        assert_eq!(json["kind"], "unknown_channel");
        assert_eq!(json["unit"], "Other_1.jpg");
    }
}
