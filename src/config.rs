//! TOML configuration.
//!
//! Everything the pipeline needs from its environment (store location,
//! input roots, the channel mapping, detector endpoint, stage timeouts) is
//! read from one file and handed to each component at construction. Nothing
//! in the core consults process-global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, String>,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

fn default_busy_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Root of the dated batch directories (`{root}/{YYYY-MM-DD}/{channel}.json`).
    pub batch_root: PathBuf,
    /// Directory holding downloaded media artifacts.
    pub artifact_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
    /// Record artifacts with zero detections so later runs skip them.
    #[serde(default)]
    pub mark_empty_processed: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            recursive: false,
            mark_empty_processed: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "*.jpg".to_string(),
        "*.jpeg".to_string(),
        "*.png".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_detector_timeout")]
    pub timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            timeout_secs: default_detector_timeout(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_detector_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_ingest_timeout")]
    pub ingest_timeout_secs: u64,
    #[serde(default = "default_enrich_timeout")]
    pub enrich_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enrich_after_ingest: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_timeout_secs: default_ingest_timeout(),
            enrich_timeout_secs: default_enrich_timeout(),
            enrich_after_ingest: true,
        }
    }
}

impl PipelineConfig {
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_secs(self.enrich_timeout_secs)
    }
}

fn default_ingest_timeout() -> u64 {
    600
}
fn default_enrich_timeout() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.ingest_timeout_secs == 0 || config.pipeline.enrich_timeout_secs == 0 {
        anyhow::bail!("pipeline stage timeouts must be > 0");
    }

    if config.enrichment.include_globs.is_empty() {
        anyhow::bail!("enrichment.include_globs must not be empty");
    }

    for (name, identifier) in &config.channels {
        if name.is_empty() || identifier.is_empty() {
            anyhow::bail!("channel mapping entries must be non-empty ('{}')", name);
        }
        if name.contains('_') {
            anyhow::bail!(
                "channel name '{}' contains '_', which the artifact naming convention reserves",
                name
            );
        }
    }

    match config.detector.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.detector.url.is_none() {
                anyhow::bail!("detector.url must be specified when provider is 'http'");
            }
            if config.detector.timeout_secs == 0 {
                anyhow::bail!("detector.timeout_secs must be > 0");
            }
        }
        other => anyhow::bail!(
            "Unknown detector provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    Ok(())
}
