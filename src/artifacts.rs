use anyhow::Result;
use chrono::NaiveDate;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::EnrichmentConfig;
use crate::models::{Anomaly, AnomalyKind, ArtifactDescriptor};

const MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// An eligible media file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    /// Path relative to the artifact root, `/`-separated.
    pub media_path: String,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct ArtifactScan {
    pub files: Vec<ArtifactFile>,
    pub anomalies: Vec<Anomaly>,
    pub root_missing: bool,
}

pub struct ArtifactScanner {
    root: PathBuf,
    include: GlobSet,
    recursive: bool,
}

impl ArtifactScanner {
    pub fn new(root: impl Into<PathBuf>, config: &EnrichmentConfig) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            include: build_globset(&config.include_globs)?,
            recursive: config.recursive,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List eligible files in file-name order.
    pub fn scan(&self) -> ArtifactScan {
        let mut scan = ArtifactScan::default();
        if !self.root.is_dir() {
            scan.root_missing = true;
            return scan;
        }

        let mut walker = WalkDir::new(&self.root).min_depth(1).sort_by_file_name();
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let unit = e.path().unwrap_or(&self.root).display().to_string();
                    scan.anomalies
                        .push(Anomaly::new(AnomalyKind::ScanFailure, unit, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let media_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if !self.include.is_match(&media_path) {
                continue;
            }

            scan.files.push(ArtifactFile {
                media_path,
                path: path.to_path_buf(),
            });
        }

        scan
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

/// Parse `{channel_name}_{source_id}[_{date}].{ext}` from the file name of a
/// media path. The date may be `YYYYMMDD` or `YYYY-MM-DD`.
pub fn parse_artifact_name(media_path: &str) -> Result<ArtifactDescriptor, String> {
    let file_name = media_path.rsplit('/').next().unwrap_or(media_path);
    let (stem, ext) = file_name
        .rsplit_once('.')
        .ok_or_else(|| format!("no extension in '{}'", file_name))?;

    let ext = ext.to_ascii_lowercase();
    if !MEDIA_EXTENSIONS.contains(&ext.as_str()) {
        return Err(format!("unsupported extension '.{}'", ext));
    }

    let parts: Vec<&str> = stem.split('_').collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(format!(
            "expected Channel_SourceId[_Date].{{jpg,jpeg,png}}, got '{}'",
            file_name
        ));
    }

    let channel_name = parts[0];
    if channel_name.is_empty() {
        return Err(format!("empty channel name in '{}'", file_name));
    }

    let id = parts[1];
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("source id '{}' is not numeric", id));
    }
    let source_id: i64 = id
        .parse()
        .map_err(|e| format!("source id '{}' out of range: {}", id, e))?;

    let date = match parts.get(2) {
        None => None,
        Some(raw) => Some(
            NaiveDate::parse_from_str(raw, "%Y%m%d")
                .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
                .map_err(|_| format!("date part '{}' is not a date", raw))?,
        ),
    };

    Ok(ArtifactDescriptor {
        media_path: media_path.to_string(),
        channel_name: channel_name.to_string(),
        source_id,
        date,
    })
}
