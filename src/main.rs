//! # Scrapeline CLI
//!
//! ## Usage
//!
//! ```bash
//! scrapeline --config ./config/scrapeline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scrapeline init` | Create the SQLite database and schema |
//! | `scrapeline ingest` | Load batch files into `raw_records` |
//! | `scrapeline enrich` | Run detection over unprocessed artifacts |
//! | `scrapeline run` | Ingest then enrich through the stage graph |
//! | `scrapeline check` | Print an integrity overview of the store |
//!
//! Every run command is safe to repeat. Only store failures exit non-zero
//! from `ingest` and `enrich`; `run` also exits non-zero when any stage did
//! not succeed, so an external scheduler can retry it.

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use scrapeline::channels::{ChannelResolver, StaticChannelMap};
use scrapeline::check;
use scrapeline::config::{self, Config};
use scrapeline::db;
use scrapeline::detect;
use scrapeline::enrich::Enricher;
use scrapeline::ingest::Loader;
use scrapeline::migrate;
use scrapeline::models::{Anomaly, EnrichSummary, IngestSummary, RunCounts};
use scrapeline::observer::{ObserverMode, RunObserver};
use scrapeline::pipeline::{PipelineContext, StageOutput, TaskGraph};

/// Scrapeline: idempotent ingestion and incremental enrichment of scraped
/// channel records and media.
#[derive(Parser)]
#[command(name = "scrapeline", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/scrapeline.toml")]
    config: PathBuf,

    /// How run events are reported: `log` (tracing on stderr), `json`
    /// (JSON lines on stderr) or `off`.
    #[arg(long, global = true, value_enum, default_value = "log")]
    events: ObserverMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema. Idempotent.
    Init,

    /// Load batch files into the canonical store.
    ///
    /// Records already stored under the same (source id, channel) are left
    /// untouched and counted as skipped.
    Ingest {
        /// Only ingest batches collected on this date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Run object detection over artifacts not yet processed.
    Enrich {
        /// Show the candidate set without invoking the detector.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run ingest and enrich through the stage graph.
    Run {
        /// Only ingest batches collected on this date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Print record and detection counts and integrity findings.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    let observer = cli.events.observer();
    let resolver: Arc<dyn ChannelResolver> =
        Arc::new(StaticChannelMap::new(cfg.channels.clone()));

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg.db).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { date } => {
            let pool = db::connect(&cfg.db).await?;
            let loader = Loader::from_config(&cfg, resolver, observer);
            let summary = loader.run(&pool, date).await?;
            print_ingest(&summary);
            println!("ok");
            pool.close().await;
        }
        Commands::Enrich { dry_run } => {
            let pool = db::connect(&cfg.db).await?;
            let enricher = build_enricher(&cfg, resolver, observer)?;
            if dry_run {
                let plan = enricher.plan(&pool).await?;
                println!("enrich (dry-run)");
                println!("  artifacts on disk: {}", plan.on_disk);
                println!("  already processed: {}", plan.already_processed);
                println!("  candidates: {}", plan.candidates.len());
                for candidate in &plan.candidates {
                    println!("    {}", candidate.media_path);
                }
            } else {
                let summary = enricher.run(&pool).await?;
                print_enrich(&summary);
            }
            println!("ok");
            pool.close().await;
        }
        Commands::Run { date } => {
            let graph = TaskGraph::standard(&cfg.pipeline)?;
            let pool = db::connect(&cfg.db).await?;
            let ctx = PipelineContext {
                pool: pool.clone(),
                loader: Loader::from_config(&cfg, resolver.clone(), observer.clone()),
                enricher: build_enricher(&cfg, resolver, observer.clone())?,
                ingest_date: date,
                observer,
            };

            let report = graph.run(&ctx).await;
            println!("run {}", report.run_id);
            for stage in &report.stages {
                println!(
                    "  {}: {} ({} ms)",
                    stage.stage,
                    stage.status,
                    stage.elapsed.as_millis()
                );
            }
            for stage in &report.stages {
                match &stage.output {
                    Some(StageOutput::Ingest(summary)) => print_ingest(summary),
                    Some(StageOutput::Enrich(summary)) => print_enrich(summary),
                    None => {}
                }
            }
            pool.close().await;

            if !report.succeeded() {
                anyhow::bail!("pipeline run {} did not complete", report.run_id);
            }
            println!("ok");
        }
        Commands::Check => {
            let pool = db::connect(&cfg.db).await?;
            let report = check::integrity_report(&pool).await?;
            pool.close().await;

            println!("Scrapeline — Store Check");
            println!("========================");
            println!();
            println!("  Database:            {}", cfg.db.path.display());
            println!("  Raw records:         {}", report.raw_records);
            println!("  Detections:          {}", report.detections);
            println!("  Processed artifacts: {}", report.processed_artifacts);
            println!("  Empty artifacts:     {}", report.empty_artifacts);

            if !report.by_channel.is_empty() {
                println!();
                println!("  {:<28} {:>8} {:>10}", "CHANNEL", "RECORDS", "DETECTIONS");
                println!("  {}", "-".repeat(48));
                for c in &report.by_channel {
                    println!(
                        "  {:<28} {:>8} {:>10}",
                        c.channel_identifier, c.raw_records, c.detections
                    );
                }
            }

            println!();
            if report.orphans.is_empty() {
                println!("  All detections match a raw record.");
            } else {
                println!("  Detections without a raw record:");
                for o in &report.orphans {
                    println!(
                        "    ({}, {}): {} detection(s)",
                        o.source_id, o.channel_identifier, o.detections
                    );
                }
            }

            if !report.is_consistent() {
                for (id, n) in &report.duplicate_detection_ids {
                    println!("  duplicate detection_id {} ({} rows)", id, n);
                }
                anyhow::bail!("duplicate detection ids found");
            }
            println!("  No duplicate detection ids.");
            println!("ok");
        }
    }

    Ok(())
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_enricher(
    cfg: &Config,
    resolver: Arc<dyn ChannelResolver>,
    observer: Arc<dyn RunObserver>,
) -> Result<Enricher> {
    let detector = detect::create_detector(&cfg.detector)?;
    Enricher::from_config(cfg, resolver, detector, observer)
}

fn print_counts(counts: &RunCounts) {
    println!("  inserted: {}", counts.inserted);
    println!("  skipped: {}", counts.skipped);
    println!("  errored: {}", counts.errored);
}

fn print_anomalies(anomalies: &[Anomaly]) {
    if anomalies.is_empty() {
        return;
    }
    println!("  anomalies: {}", anomalies.len());
    for a in anomalies {
        println!("    {:?} {}: {}", a.kind, a.unit, a.detail);
    }
}

fn print_ingest(summary: &IngestSummary) {
    println!("ingest");
    println!("  batches: {}", summary.batches);
    print_counts(&summary.counts);
    print_anomalies(&summary.anomalies);
}

fn print_enrich(summary: &EnrichSummary) {
    let a = &summary.artifacts;
    println!("enrich");
    println!("  artifacts on disk: {}", a.on_disk);
    println!("  already processed: {}", a.already_processed);
    println!("  candidates: {}", a.candidates);
    println!("  with detections: {}", a.with_detections);
    println!("  without detections: {}", a.without_detections);
    println!("  skipped artifacts: {}", a.skipped);
    println!("  failed artifacts: {}", a.failed);
    print_counts(&summary.counts);
    print_anomalies(&summary.anomalies);
}
