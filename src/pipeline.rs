//! In-process task graph over the pipeline stages.
//!
//! A [`TaskGraph`] holds [`StageSpec`]s with explicit dependency edges and a
//! per-stage timeout. [`TaskGraph::run`] executes stages in dependency order,
//! one at a time, and returns a structured [`PipelineReport`]. A stage whose
//! dependency did not succeed is skipped. A timed-out stage is dropped
//! mid-flight; its open transaction rolls back and earlier committed units
//! stay, which a re-run tolerates.

use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::enrich::Enricher;
use crate::error::PipelineError;
use crate::ingest::Loader;
use crate::models::{EnrichSummary, IngestSummary};
use crate::observer::{PipelineEvent, RunObserver};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Ingest,
    Enrich,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Enrich => "enrich",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct StageSpec {
    pub stage: Stage,
    pub depends_on: Vec<Stage>,
    pub timeout: Duration,
}

impl StageSpec {
    pub fn new(stage: Stage, timeout: Duration) -> Self {
        Self {
            stage,
            depends_on: Vec::new(),
            timeout,
        }
    }

    pub fn after(mut self, dependency: Stage) -> Self {
        self.depends_on.push(dependency);
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("stage '{0}' declared twice")]
    DuplicateStage(Stage),
    #[error("stage '{stage}' depends on undeclared stage '{dependency}'")]
    UnknownDependency { stage: Stage, dependency: Stage },
    #[error("dependency cycle among stages")]
    Cycle,
}

/// What a stage produced.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Ingest(IngestSummary),
    Enrich(EnrichSummary),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed(String),
    TimedOut,
    /// Not run because this dependency did not succeed.
    SkippedUpstream(Stage),
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Succeeded => f.write_str("succeeded"),
            StageStatus::Failed(e) => write!(f, "failed: {}", e),
            StageStatus::TimedOut => f.write_str("timed out"),
            StageStatus::SkippedUpstream(s) => write!(f, "skipped ({} did not succeed)", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed: Duration,
    pub output: Option<StageOutput>,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.stages
            .iter()
            .all(|r| r.status == StageStatus::Succeeded)
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

/// Everything the stages need for one run.
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub loader: Loader,
    pub enricher: Enricher,
    pub ingest_date: Option<NaiveDate>,
    pub observer: Arc<dyn RunObserver>,
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    ordered: Vec<StageSpec>,
}

impl TaskGraph {
    /// Validate the stages and fix their execution order. Ties keep
    /// declaration order.
    pub fn new(stages: Vec<StageSpec>) -> Result<Self, GraphError> {
        for (i, spec) in stages.iter().enumerate() {
            if stages[..i].iter().any(|s| s.stage == spec.stage) {
                return Err(GraphError::DuplicateStage(spec.stage));
            }
            for dep in &spec.depends_on {
                if !stages.iter().any(|s| s.stage == *dep) {
                    return Err(GraphError::UnknownDependency {
                        stage: spec.stage,
                        dependency: *dep,
                    });
                }
            }
        }

        let mut pending = stages;
        let mut ordered: Vec<StageSpec> = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready = pending.iter().position(|spec| {
                spec.depends_on
                    .iter()
                    .all(|dep| ordered.iter().any(|done| done.stage == *dep))
            });
            match ready {
                Some(i) => ordered.push(pending.remove(i)),
                None => return Err(GraphError::Cycle),
            }
        }

        Ok(Self { ordered })
    }

    /// Ingest then enrich, with the enrich → ingest edge when configured.
    pub fn standard(config: &PipelineConfig) -> Result<Self, GraphError> {
        let ingest = StageSpec::new(Stage::Ingest, config.ingest_timeout());
        let mut enrich = StageSpec::new(Stage::Enrich, config.enrich_timeout());
        if config.enrich_after_ingest {
            enrich = enrich.after(Stage::Ingest);
        }
        Self::new(vec![ingest, enrich])
    }

    pub fn order(&self) -> Vec<Stage> {
        self.ordered.iter().map(|s| s.stage).collect()
    }

    pub async fn run(&self, ctx: &PipelineContext) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let mut reports: Vec<StageReport> = Vec::with_capacity(self.ordered.len());

        for spec in &self.ordered {
            let blocked = spec.depends_on.iter().copied().find(|dep| {
                !reports
                    .iter()
                    .any(|r| r.stage == *dep && r.status == StageStatus::Succeeded)
            });
            if let Some(dep) = blocked {
                let report = StageReport {
                    stage: spec.stage,
                    status: StageStatus::SkippedUpstream(dep),
                    elapsed: Duration::ZERO,
                    output: None,
                };
                self.finished(ctx, &report);
                reports.push(report);
                continue;
            }

            ctx.observer.observe(PipelineEvent::StageStarted {
                stage: spec.stage.to_string(),
            });
            let span = info_span!("stage", run_id = %run_id, stage = %spec.stage);
            let started = Instant::now();
            let (status, output) = run_stage(ctx, spec).instrument(span).await;

            let report = StageReport {
                stage: spec.stage,
                status,
                elapsed: started.elapsed(),
                output,
            };
            self.finished(ctx, &report);
            reports.push(report);
        }

        PipelineReport {
            run_id,
            stages: reports,
        }
    }

    fn finished(&self, ctx: &PipelineContext, report: &StageReport) {
        ctx.observer.observe(PipelineEvent::StageFinished {
            stage: report.stage.to_string(),
            status: report.status.to_string(),
            elapsed_ms: report.elapsed.as_millis() as u64,
        });
    }
}

async fn run_stage(ctx: &PipelineContext, spec: &StageSpec) -> (StageStatus, Option<StageOutput>) {
    let result = match spec.stage {
        Stage::Ingest => tokio::time::timeout(
            spec.timeout,
            async { ctx.loader.run(&ctx.pool, ctx.ingest_date).await.map(StageOutput::Ingest) },
        )
        .await,
        Stage::Enrich => tokio::time::timeout(
            spec.timeout,
            async { ctx.enricher.run(&ctx.pool).await.map(StageOutput::Enrich) },
        )
        .await,
    };

    match result {
        Ok(Ok(output)) => (StageStatus::Succeeded, Some(output)),
        Ok(Err(err)) => (StageStatus::Failed(describe(&err)), None),
        Err(_) => (StageStatus::TimedOut, None),
    }
}

fn describe(err: &PipelineError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
