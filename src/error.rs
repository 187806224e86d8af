//! Failures that cross a component boundary.
//!
//! Only the store class is raised. Every other anomaly (malformed payload,
//! unparseable artifact name, unknown channel, detector failure, unexpected
//! constraint conflict) is absorbed, counted, and reported as an
//! [`Anomaly`](crate::models::Anomaly).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The canonical store could not be opened, reached, or a transaction
    /// could not be started.
    #[error("canonical store unavailable: {0}")]
    StoreUnavailable(#[source] sqlx::Error),

    /// Filesystem preparation for the store failed (e.g. the database
    /// directory cannot be created).
    #[error("canonical store unavailable: {path}: {source}")]
    StorePath {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A fatal store error while writing a unit. The unit's transaction was
    /// rolled back in full.
    #[error("store write failed for {unit}: {source}")]
    StoreWrite {
        unit: String,
        #[source]
        source: sqlx::Error,
    },
}

impl PipelineError {
    pub fn write(unit: impl Into<String>, source: sqlx::Error) -> Self {
        PipelineError::StoreWrite {
            unit: unit.into(),
            source,
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
