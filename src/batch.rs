//! Batch files: discovery under the batch root and payload parsing.
//!
//! Layout: `{batch_root}/{YYYY-MM-DD}/{channel}.json`, each file a JSON array
//! of record payloads. The directory name is the collection date and the file
//! stem is the channel the batch is bound to.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::channels::ChannelResolver;
use crate::models::{Anomaly, AnomalyKind, RawRecord};

/// One batch: a file bound to a channel and a collection date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub path: PathBuf,
    pub channel: String,
    pub collected_date: NaiveDate,
}

impl BatchFile {
    pub fn label(&self) -> String {
        self.path.display().to_string()
    }
}

/// Result of scanning the batch root.
#[derive(Debug, Default)]
pub struct BatchListing {
    pub files: Vec<BatchFile>,
    /// Roots or date directories that did not exist.
    pub missing: Vec<PathBuf>,
    pub anomalies: Vec<Anomaly>,
}

/// Find batch files, in date then channel order. With `date`, only that
/// date's directory is considered.
pub fn discover(root: &Path, date: Option<NaiveDate>) -> BatchListing {
    let mut listing = BatchListing::default();

    if !root.is_dir() {
        listing.missing.push(root.to_path_buf());
        return listing;
    }

    let date_dirs: Vec<(PathBuf, NaiveDate)> = match date {
        Some(d) => {
            let dir = root.join(d.format("%Y-%m-%d").to_string());
            if !dir.is_dir() {
                listing.missing.push(dir);
                return listing;
            }
            vec![(dir, d)]
        }
        None => {
            let mut dirs = Vec::new();
            for entry in WalkDir::new(root)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        listing.anomalies.push(scan_anomaly(root, &e));
                        continue;
                    }
                };
                if !entry.file_type().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if let Ok(d) = NaiveDate::parse_from_str(&name, "%Y-%m-%d") {
                    dirs.push((entry.path().to_path_buf(), d));
                }
            }
            dirs
        }
    };

    for (dir, collected_date) in date_dirs {
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    listing.anomalies.push(scan_anomaly(&dir, &e));
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let Some(channel) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            listing.files.push(BatchFile {
                path: path.to_path_buf(),
                channel,
                collected_date,
            });
        }
    }

    listing
}

fn scan_anomaly(dir: &Path, err: &walkdir::Error) -> Anomaly {
    let unit = err
        .path()
        .unwrap_or(dir)
        .display()
        .to_string();
    Anomaly::new(AnomalyKind::ScanFailure, unit, err.to_string())
}

/// Raw contents of a batch file.
#[derive(Debug, PartialEq)]
pub enum BatchContents {
    Missing,
    Payloads(Vec<Value>),
}

/// Read a batch file. A missing file is [`BatchContents::Missing`]; an empty
/// file is an empty payload list. Anything that is not a JSON array is an
/// error description.
pub fn read_batch(path: &Path) -> Result<BatchContents, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BatchContents::Missing),
        Err(e) => return Err(format!("unreadable batch file: {}", e)),
    };

    if content.trim().is_empty() {
        return Ok(BatchContents::Payloads(Vec::new()));
    }

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(items)) => Ok(BatchContents::Payloads(items)),
        Ok(_) => Err("top level is not a JSON array".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

/// Wire shape of one payload. Upstream field names are accepted as aliases.
#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(alias = "message_id", alias = "id")]
    source_id: i64,
    channel: Option<String>,
    date: Option<String>,
    text: Option<String>,
    views: Option<i64>,
    forwards: Option<i64>,
    #[serde(alias = "has_photo")]
    has_media: Option<bool>,
    #[serde(alias = "photo_path")]
    media_path: Option<String>,
}

/// Turn one payload into a [`RawRecord`], or describe why it is malformed.
///
/// An unmapped channel keeps its name as identifier.
pub fn parse_payload(
    value: &Value,
    batch: &BatchFile,
    resolver: &dyn ChannelResolver,
) -> Result<RawRecord, String> {
    let payload: Payload =
        serde_json::from_value(value.clone()).map_err(|e| format!("malformed payload: {}", e))?;

    let channel_name = payload.channel.unwrap_or_else(|| batch.channel.clone());
    if channel_name.trim().is_empty() {
        return Err("malformed payload: empty channel".to_string());
    }

    let source_date = match payload.date.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            parse_source_date(raw)
                .ok_or_else(|| format!("malformed payload: unparseable date '{}'", raw))?,
        ),
    };

    let channel_identifier = resolver
        .resolve(&channel_name)
        .unwrap_or_else(|| channel_name.clone());
    let media_path = payload.media_path.filter(|p| !p.is_empty());

    Ok(RawRecord {
        source_id: payload.source_id,
        channel_name,
        channel_identifier,
        collected_date: batch.collected_date,
        source_date,
        text: payload.text.unwrap_or_default(),
        views: payload.views,
        forwards: payload.forwards,
        has_media: payload.has_media.unwrap_or(media_path.is_some()),
        media_path,
    })
}

/// Accepts RFC 3339, naive date-times (`T` or space separated, assumed UTC),
/// space-separated date-times with offset, and bare dates.
pub fn parse_source_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::StaticChannelMap;
    use serde_json::json;

    fn batch() -> BatchFile {
        BatchFile {
            path: PathBuf::from("/data/2025-01-15/Chemed.json"),
            channel: "Chemed".to_string(),
            collected_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
        }
    }

    fn resolver() -> StaticChannelMap {
        [("Chemed", "@CheMed123")].into_iter().collect()
    }

    #[test]
    fn upstream_field_names_are_accepted() {
        let value = json!({
            "message_id": 97,
            "channel": "Chemed",
            "date": "2025-01-14T08:30:00+03:00",
            "text": "Paracetamol in stock",
            "views": 1200,
            "forwards": null,
            "has_photo": true,
            "photo_path": "data/images/Chemed_97.jpg"
        });
        let record = parse_payload(&value, &batch(), &resolver()).unwrap();
        assert_eq!(record.source_id, 97);
        assert_eq!(record.channel_identifier, "@CheMed123");
        assert_eq!(record.views, Some(1200));
        assert_eq!(record.forwards, None);
        assert!(record.has_media);
        assert_eq!(
            record.source_date.unwrap().to_rfc3339(),
            "2025-01-14T05:30:00+00:00"
        );
        assert_eq!(record.text_length(), 20);
    }

    #[test]
    fn minimal_payload_inherits_batch_channel() {
        let record = parse_payload(&json!({"id": 5}), &batch(), &resolver()).unwrap();
        assert_eq!(record.channel_name, "Chemed");
        assert_eq!(record.text, "");
        assert!(!record.has_media);
        assert_eq!(record.source_date, None);
    }

    #[test]
    fn unmapped_channel_keeps_name() {
        let record =
            parse_payload(&json!({"id": 1, "channel": "A"}), &batch(), &resolver()).unwrap();
        assert_eq!(record.channel_identifier, "A");
    }

    #[test]
    fn missing_id_is_malformed() {
        let err = parse_payload(&json!({"channel": "A"}), &batch(), &resolver()).unwrap_err();
        assert!(err.starts_with("malformed payload"));
    }

    #[test]
    fn wrong_type_is_malformed() {
        assert!(parse_payload(&json!({"id": "x1"}), &batch(), &resolver()).is_err());
        assert!(parse_payload(&json!("just a string"), &batch(), &resolver()).is_err());
    }

    #[test]
    fn bad_date_is_malformed() {
        let err =
            parse_payload(&json!({"id": 1, "date": "yesterday"}), &batch(), &resolver())
                .unwrap_err();
        assert!(err.contains("unparseable date"));
    }

    #[test]
    fn date_formats() {
        assert!(parse_source_date("2025-01-14T08:30:00Z").is_some());
        assert!(parse_source_date("2025-01-14 08:30:00+00:00").is_some());
        assert!(parse_source_date("2025-01-14T08:30:00").is_some());
        assert!(parse_source_date("2025-01-14 08:30:00.123").is_some());
        assert!(parse_source_date("2025-01-14").is_some());
        assert!(parse_source_date("14/01/2025").is_none());
    }

    #[test]
    fn read_batch_variants() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope.json");
        assert_eq!(read_batch(&missing).unwrap(), BatchContents::Missing);

        let empty = tmp.path().join("empty.json");
        std::fs::write(&empty, "  \n").unwrap();
        assert_eq!(read_batch(&empty).unwrap(), BatchContents::Payloads(vec![]));

        let object = tmp.path().join("object.json");
        std::fs::write(&object, r#"{"id": 1}"#).unwrap();
        assert!(read_batch(&object).is_err());

        let array = tmp.path().join("array.json");
        std::fs::write(&array, r#"[{"id": 1}, {"id": 2}]"#).unwrap();
        match read_batch(&array).unwrap() {
            BatchContents::Payloads(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn discover_orders_and_filters() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        for (date, channel) in [
            ("2025-01-16", "Chemed"),
            ("2025-01-15", "TikvahPharma"),
            ("2025-01-15", "Chemed"),
        ] {
            std::fs::create_dir_all(root.join(date)).unwrap();
            std::fs::write(root.join(date).join(format!("{}.json", channel)), "[]").unwrap();
        }
        std::fs::create_dir_all(root.join("not-a-date")).unwrap();
        std::fs::write(root.join("2025-01-15").join("notes.txt"), "x").unwrap();

        let listing = discover(root, None);
        let names: Vec<(String, String)> = listing
            .files
            .iter()
            .map(|f| (f.collected_date.to_string(), f.channel.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("2025-01-15".to_string(), "Chemed".to_string()),
                ("2025-01-15".to_string(), "TikvahPharma".to_string()),
                ("2025-01-16".to_string(), "Chemed".to_string()),
            ]
        );
        assert!(listing.missing.is_empty());

        let one_day = discover(root, NaiveDate::from_ymd_opt(2025, 1, 16));
        assert_eq!(one_day.files.len(), 1);

        let absent = discover(root, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert!(absent.files.is_empty());
        assert_eq!(absent.missing.len(), 1);
    }
}
