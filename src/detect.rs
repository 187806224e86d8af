//! Detection capability abstraction and implementations.
//!
//! Defines the [`Detector`] trait and concrete providers:
//! - **[`DisabledDetector`]**: fails every call; used when no detector is configured.
//! - **[`HttpDetector`]**: posts the image to an object-detection inference
//!   endpoint and parses the reported objects.
//!
//! Use [`create_detector`] to build the provider named in `[detector]`.
//!
//! # HTTP protocol
//!
//! Request: `POST {url}` with JSON
//! `{"model": "...", "filename": "Chemed_97.jpg", "image": "<base64>"}`.
//!
//! Response: `{"detections": [{"class": "bottle", "confidence": 0.87}, ...]}`.
//! `label` or `name` are accepted for `class`, `score` for `confidence`.
//! A non-2xx status is a failure for that artifact only. Calls are not retried.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DetectorConfig;
use crate::models::Detection;

/// An object-detection backend.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Identifier recorded with empty-artifact markers (e.g. `"yolov8n"`).
    fn name(&self) -> &str;

    /// Detect objects in one artifact. May return an empty list; fails on
    /// unreadable input or backend errors.
    async fn detect(&self, artifact: &Path) -> Result<Vec<Detection>>;
}

/// Build the detector configured in `[detector]`.
pub fn create_detector(config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledDetector)),
        "http" => Ok(Arc::new(HttpDetector::new(config)?)),
        other => bail!("Unknown detector provider: {}", other),
    }
}

// ============ Disabled Detector ============

pub struct DisabledDetector;

#[async_trait]
impl Detector for DisabledDetector {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn detect(&self, _artifact: &Path) -> Result<Vec<Detection>> {
        bail!("Detector is disabled")
    }
}

// ============ HTTP Detector ============

pub struct HttpDetector {
    url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("detector.url required for http provider"))?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { url, model, client })
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(alias = "label", alias = "name")]
    class: String,
    #[serde(alias = "score")]
    confidence: f64,
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        &self.model
    }

    async fn detect(&self, artifact: &Path) -> Result<Vec<Detection>> {
        let bytes = tokio::fs::read(artifact)
            .await
            .with_context(|| format!("Failed to read artifact: {}", artifact.display()))?;

        let filename = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let body = serde_json::json!({
            "model": self.model,
            "filename": filename,
            "image": base64::engine::general_purpose::STANDARD.encode(&bytes),
        });

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Detector error {}: {}", status, text);
        }

        let parsed: DetectResponse = response
            .json()
            .await
            .context("Invalid detector response")?;
        Ok(parse_detections(parsed))
    }
}

fn parse_detections(response: DetectResponse) -> Vec<Detection> {
    response
        .detections
        .into_iter()
        .map(|d| Detection {
            class_label: d.class,
            confidence: d.confidence,
        })
        .collect()
}
