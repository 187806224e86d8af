//! # Scrapeline
//!
//! Idempotent, incremental ingestion and enrichment of scraped channel
//! records and their media artifacts.
//!
//! Runs may be repeated, overlap with earlier partial runs, or be retried by
//! an external scheduler after a crash: raw records are insert-if-absent on
//! their natural key, detections carry deterministic identifiers, and the set
//! of already-enriched artifacts is recomputed from the store every run.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐
//! │ batch JSON │──▶│  Loader  │──────────────┐
//! └────────────┘   └──────────┘              ▼
//!                                      ┌───────────┐
//! ┌────────────┐   ┌──────────┐        │  SQLite   │
//! │ artifacts  │──▶│ Enricher │───────▶│ raw +     │
//! └────────────┘   └────┬─────┘        │ detections│
//!                       │   ▲          └─────┬─────┘
//!                       ▼   │  processed set │
//!                  ┌──────────┐◀─────────────┘
//!                  │ Detector │
//!                  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Fatal store errors |
//! | [`channels`] | Channel name → identifier resolution |
//! | [`models`] | Records, detections, summaries, anomalies |
//! | [`batch`] | Batch discovery and payload parsing |
//! | [`ingest`] | Ingestion loader |
//! | [`artifacts`] | Artifact scanning and naming convention |
//! | [`tracker`] | Processed-artifact snapshot |
//! | [`detect`] | Detection capability abstraction |
//! | [`enrich`] | Enrichment processor |
//! | [`policy`] | Conflict classification and units of work |
//! | [`pipeline`] | Stage task graph |
//! | [`observer`] | Run event port |
//! | [`check`] | Store integrity overview |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod artifacts;
pub mod batch;
pub mod channels;
pub mod check;
pub mod config;
pub mod db;
pub mod detect;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod observer;
pub mod pipeline;
pub mod policy;
pub mod tracker;
