//! Attribute metadata for stored vectors
//!
//! Each vector id owns exactly one live metadata record. Records are
//! append-only: updates write a new line that shadows the previous one for
//! the same id, and tombstoning appends a shadow record with `_tombstone`
//! set. On open the log is replayed in order, so the last line per id wins.
//!
//! # On-disk layout (`metadata.jsonl`)
//!
//! One JSON object per line:
//!
//! ```text
//! {"id":0,"type":"journal","date":"2024-03-01","source":"notes/aapl.md","asset_tag":"AAPL","bias":"long","r_multiple":1.8}
//! {"id":0,"type":"journal","source":"notes/aapl.md","_tombstone":true}
//! ```
//!
//! Recognized slots are typed; any other attribute rides in the record's
//! extra map and is preserved byte-for-byte through rewrites.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("invalid date string: {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),
}

/// Document category of the source a vector was embedded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Journal,
    Chart,
    Note,
    Report,
    #[serde(other)]
    Other,
}

/// Directional bias attached to a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bias {
    Long,
    Short,
    Neutral,
}

/// One metadata record. The `id` binds it to a vector in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: u32,

    #[serde(rename = "type")]
    pub doc_type: DocType,

    /// ISO-8601 calendar date (`YYYY-MM-DD`) or absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(rename = "source")]
    pub source_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<Bias>,

    /// Sparse numeric attributes plus any attribute names this version does
    /// not recognize, preserved opaquely.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    #[serde(rename = "_tombstone", default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstone: bool,
}

impl MetadataRecord {
    pub fn new(doc_type: DocType, source_path: impl Into<String>) -> Self {
        Self {
            id: 0,
            doc_type,
            date: None,
            source_path: source_path.into(),
            asset_tag: None,
            bias: None,
            extra: serde_json::Map::new(),
            tombstone: false,
        }
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn with_asset_tag(mut self, tag: impl Into<String>) -> Self {
        self.asset_tag = Some(tag.into());
        self
    }

    pub fn with_bias(mut self, bias: Bias) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_numeric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extra.insert(name.into(), serde_json::json!(value));
        self
    }

    /// Look up a numeric attribute by name.
    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.extra.get(name).and_then(|v| v.as_f64())
    }
}

/// Validate a `YYYY-MM-DD` calendar date string.
///
/// Lexicographic comparison of strings in this format matches chronological
/// order, which is what the date-range predicate relies on.
pub fn validate_date(date: &str) -> Result<(), MetadataError> {
    let bytes = date.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, &b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !shape_ok {
        return Err(MetadataError::InvalidDate(date.to_string()));
    }

    let month: u32 = date[5..7].parse().unwrap_or(0);
    let day: u32 = date[8..10].parse().unwrap_or(0);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(MetadataError::InvalidDate(date.to_string()));
    }
    Ok(())
}

/// Append-only metadata log with an in-memory latest-record index.
pub struct MetadataStore {
    path: PathBuf,
    writer: BufWriter<File>,
    latest: HashMap<u32, MetadataRecord>,
    live: usize,
    tombstoned: usize,
}

impl MetadataStore {
    /// Create an empty log. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            latest: HashMap::new(),
            live: 0,
            tombstoned: 0,
        })
    }

    /// Open an existing log, replaying it in order. Later records shadow
    /// earlier ones for the same id.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetadataError> {
        let path = path.as_ref().to_path_buf();
        let reader = BufReader::new(File::open(&path)?);

        let mut latest: HashMap<u32, MetadataRecord> = HashMap::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: MetadataRecord =
                serde_json::from_str(&line).map_err(|e| MetadataError::Malformed {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            latest.insert(record.id, record);
        }

        let tombstoned = latest.values().filter(|r| r.tombstone).count();
        let live = latest.len() - tombstoned;

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            latest,
            live,
            tombstoned,
        })
    }

    /// Append a record, shadowing any previous record for the same id.
    pub fn append(&mut self, record: MetadataRecord) -> Result<(), MetadataError> {
        let line = serde_json::to_string(&record).map_err(|e| MetadataError::Malformed {
            line: 0,
            reason: e.to_string(),
        })?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;

        match self.latest.insert(record.id, record) {
            None => self.live += 1,
            Some(prev) => {
                let cur = &self.latest[&prev.id];
                match (prev.tombstone, cur.tombstone) {
                    (false, true) => {
                        self.live -= 1;
                        self.tombstoned += 1;
                    }
                    (true, false) => {
                        self.tombstoned -= 1;
                        self.live += 1;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Append a tombstone shadow for `id`. Returns false if the id is
    /// unknown or already tombstoned.
    pub fn tombstone(&mut self, id: u32) -> Result<bool, MetadataError> {
        match self.latest.get(&id) {
            Some(record) if !record.tombstone => {
                let mut shadow = record.clone();
                shadow.tombstone = true;
                self.append(shadow)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Latest record for `id`, tombstoned or not.
    pub fn get(&self, id: u32) -> Option<&MetadataRecord> {
        self.latest.get(&id)
    }

    pub fn is_tombstoned(&self, id: u32) -> bool {
        self.latest.get(&id).map(|r| r.tombstone).unwrap_or(false)
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.latest.get(&id).map(|r| !r.tombstone).unwrap_or(false)
    }

    /// Number of ids with any record.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn tombstoned_count(&self) -> usize {
        self.tombstoned
    }

    /// Evaluate a filter against the live record for `id`. Tombstoned and
    /// unknown ids never match.
    pub fn matches(&self, id: u32, filter: &crate::filter::Filter) -> bool {
        match self.latest.get(&id) {
            Some(record) if !record.tombstone => filter.matches(record),
            _ => false,
        }
    }

    /// Flush buffered lines and fsync the log.
    pub fn flush(&mut self) -> Result<(), MetadataError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Write a compacted log (latest record per id, ascending id order) to
    /// `path`. Used by `optimize`; the original log is untouched.
    pub fn compact_to(&self, path: impl AsRef<Path>) -> Result<(), MetadataError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let mut writer = BufWriter::new(file);

        let mut ids: Vec<u32> = self.latest.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let record = &self.latest[&id];
            let line = serde_json::to_string(record).map_err(|e| MetadataError::Malformed {
                line: 0,
                reason: e.to_string(),
            })?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: u32) -> MetadataRecord {
        let mut r = MetadataRecord::new(DocType::Journal, format!("notes/{id}.md"))
            .with_date("2024-03-01")
            .with_asset_tag("AAPL")
            .with_bias(Bias::Long)
            .with_numeric("r_multiple", 1.8);
        r.id = id;
        r
    }

    #[test]
    fn record_json_shape() {
        let r = record(3);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["type"], "journal");
        assert_eq!(json["date"], "2024-03-01");
        assert_eq!(json["source"], "notes/3.md");
        assert_eq!(json["bias"], "long");
        assert_eq!(json["r_multiple"], 1.8);
        assert!(json.get("_tombstone").is_none());
    }

    #[test]
    fn unknown_attributes_survive_roundtrip() {
        let line = r#"{"id":9,"type":"chart","source":"charts/es.png","vendor_checksum":"abc123","pnl":-42.5}"#;
        let r: MetadataRecord = serde_json::from_str(line).unwrap();
        assert_eq!(r.extra["vendor_checksum"], "abc123");
        assert_eq!(r.numeric("pnl"), Some(-42.5));

        let back = serde_json::to_value(&r).unwrap();
        assert_eq!(back["vendor_checksum"], "abc123");
    }

    #[test]
    fn unrecognized_doc_type_maps_to_other() {
        let line = r#"{"id":1,"type":"voicememo","source":"a"}"#;
        let r: MetadataRecord = serde_json::from_str(line).unwrap();
        assert_eq!(r.doc_type, DocType::Other);
    }

    #[test]
    fn shadowing_and_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.jsonl");

        let mut store = MetadataStore::create(&path).unwrap();
        store.append(record(0)).unwrap();
        store.append(record(1)).unwrap();
        assert_eq!(store.live_count(), 2);

        // Shadow id 0 with a new asset tag.
        let mut updated = record(0);
        updated.asset_tag = Some("MSFT".into());
        store.append(updated).unwrap();
        assert_eq!(store.live_count(), 2);
        assert_eq!(store.get(0).unwrap().asset_tag.as_deref(), Some("MSFT"));

        assert!(store.tombstone(1).unwrap());
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.tombstoned_count(), 1);
        // Double-tombstone is a no-op.
        assert!(!store.tombstone(1).unwrap());
        assert!(!store.tombstone(99).unwrap());
    }

    #[test]
    fn replay_applies_last_record_per_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.jsonl");

        {
            let mut store = MetadataStore::create(&path).unwrap();
            for i in 0..4 {
                store.append(record(i)).unwrap();
            }
            store.tombstone(2).unwrap();
            store.flush().unwrap();
        }

        let store = MetadataStore::open(&path).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.live_count(), 3);
        assert_eq!(store.tombstoned_count(), 1);
        assert!(store.is_tombstoned(2));
        assert!(store.is_live(3));
    }

    #[test]
    fn open_rejects_garbage_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.jsonl");
        std::fs::write(&path, "{\"id\":0,\"type\":\"note\",\"source\":\"a\"}\nnot json\n").unwrap();

        assert!(matches!(
            MetadataStore::open(&path),
            Err(MetadataError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn compaction_keeps_one_line_per_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.jsonl");
        let compacted = dir.path().join("metadata.jsonl.tmp");

        let mut store = MetadataStore::create(&path).unwrap();
        for i in 0..3 {
            store.append(record(i)).unwrap();
        }
        store.tombstone(1).unwrap();
        store.append(record(0)).unwrap();
        store.flush().unwrap();

        store.compact_to(&compacted).unwrap();
        let text = std::fs::read_to_string(&compacted).unwrap();
        assert_eq!(text.lines().count(), 3);

        let reopened = MetadataStore::open(&compacted).unwrap();
        assert_eq!(reopened.live_count(), 2);
        assert!(reopened.is_tombstoned(1));
    }

    #[test]
    fn date_validation() {
        assert!(validate_date("2024-02-29").is_ok());
        assert!(validate_date("1999-12-31").is_ok());
        assert!(validate_date("2024-13-01").is_err());
        assert!(validate_date("2024-00-10").is_err());
        assert!(validate_date("2024-1-01").is_err());
        assert!(validate_date("yesterday").is_err());
    }
}
