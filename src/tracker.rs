//! Processed-artifact snapshot.
//!
//! The set of artifacts already enriched is derived from the store on every
//! run: the distinct `media_path`s in `detection_records`, plus the
//! `empty_artifacts` markers when zero-detection artifacts are configured to
//! count as processed. No cursor is persisted and no lock is taken, so work
//! committed by a concurrent run after this read is not visible.

use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactTracker {
    include_empty: bool,
}

impl ArtifactTracker {
    pub fn new(include_empty: bool) -> Self {
        Self { include_empty }
    }

    pub async fn processed(&self, pool: &SqlitePool) -> PipelineResult<HashSet<String>> {
        let sql = if self.include_empty {
            "SELECT media_path FROM detection_records UNION SELECT media_path FROM empty_artifacts"
        } else {
            "SELECT DISTINCT media_path FROM detection_records"
        };

        let paths: Vec<String> = sqlx::query_scalar(sql)
            .fetch_all(pool)
            .await
            .map_err(PipelineError::StoreUnavailable)?;

        Ok(paths.into_iter().collect())
    }
}
