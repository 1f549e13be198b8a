//! Core data models used throughout the ingest pipeline.
//!
//! These types describe the resolved input container, the normalized records
//! emitted by the extractor, and the blob/manifest entries produced by the
//! content-addressed store. Everything here is plain data; serialization
//! shapes are what downstream loaders read from the JSONL streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Source fields that did not map onto the normalized schema.
///
/// Keys are sorted on output, which keeps re-runs byte-identical.
pub type UnmappedFields = Map<String, Value>;

/// The resolved root of raw content for one run.
#[derive(Debug, Clone)]
pub struct ExtractionContainer {
    pub root: PathBuf,
    pub case_id: String,
    /// Set when `root` was produced by unpacking an archive.
    pub source_archive: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Canonical,
    Fallback,
}

/// The structured report selected as the run's primary source.
#[derive(Debug, Clone)]
pub struct ReportDocument {
    pub path: PathBuf,
    /// Path relative to the container root, `/`-separated.
    pub relative_path: String,
    pub method: DetectionMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    Unknown,
}

impl Direction {
    /// Maps a raw direction (or call type) string onto the fixed enumeration.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "incoming" | "inbound" | "in" | "inbox" | "received" | "receive" | "missed"
            | "rejected" | "incoming call" | "missed call" => Direction::Incoming,
            "outgoing" | "outbound" | "out" | "outbox" | "sent" | "send" | "outgoing call" => {
                Direction::Outgoing
            }
            _ => Direction::Unknown,
        }
    }
}

/// Where in the report a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRef {
    /// Report path relative to the container root.
    pub file: String,
    /// Element path plus ordinal, e.g. `report/messages/message[3]`.
    pub locator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Message,
    Contact,
    Call,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Message, RecordKind::Contact, RecordKind::Call];

    /// File name of this kind's JSONL stream.
    pub fn stream_file(&self) -> &'static str {
        match self {
            RecordKind::Message => "messages.jsonl",
            RecordKind::Contact => "contacts.jsonl",
            RecordKind::Call => "calls.jsonl",
        }
    }

    /// Prefix for ids synthesized when the source carries none.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            RecordKind::Message => "msg",
            RecordKind::Contact => "contact",
            RecordKind::Call => "call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobStatus {
    /// Not yet handed to the blob store.
    Pending,
    Stored,
    /// The path did not resolve to a file inside the container.
    Unresolved,
    /// The file exists but could not be read or persisted.
    Failed,
}

/// A pointer from a record to raw binary content inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobReference {
    /// Relative path inside the container, `/`-separated.
    pub original_path: String,
    pub declared_size: Option<u64>,
    /// Declared extension, else the original path's, else sniffed from content.
    pub extension: Option<String>,
    pub status: BlobStatus,
    pub sha256: Option<String>,
}

impl BlobReference {
    pub fn new(original_path: String) -> Self {
        let extension = extension_of(&original_path);
        Self {
            original_path,
            declared_size: None,
            extension,
            status: BlobStatus::Pending,
            sha256: None,
        }
    }
}

/// Lower-cased extension of a `/`-separated path, without the dot.
pub fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            Some(ext.to_ascii_lowercase())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub case_id: String,
    pub thread_id: Option<String>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub direction: Direction,
    pub platform: Option<String>,
    pub body: String,
    /// SHA-256 of the UTF-8 body; empty bodies have none.
    pub body_sha256: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub attachments: Vec<BlobReference>,
    pub source: SourceRef,
    pub unmapped: UnmappedFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    pub id: String,
    pub case_id: String,
    pub name: Option<String>,
    pub phone_numbers: Vec<String>,
    pub emails: Vec<String>,
    /// Contact photos and other files attached to the entry.
    pub attachments: Vec<BlobReference>,
    pub source: SourceRef,
    pub unmapped: UnmappedFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct Call {
    pub id: String,
    pub case_id: String,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub call_type: Option<String>,
    pub direction: Direction,
    pub duration_secs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Call recordings and other files attached to the entry.
    pub attachments: Vec<BlobReference>,
    pub source: SourceRef,
    pub unmapped: UnmappedFields,
}

/// A normalized record. The set of kinds is closed.
#[derive(Debug, Clone)]
pub enum Record {
    Message(Message),
    Contact(Contact),
    Call(Call),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Message(_) => RecordKind::Message,
            Record::Contact(_) => RecordKind::Contact,
            Record::Call(_) => RecordKind::Call,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Record::Message(m) => &m.id,
            Record::Contact(c) => &c.id,
            Record::Call(c) => &c.id,
        }
    }

    pub fn attachments(&self) -> &[BlobReference] {
        match self {
            Record::Message(m) => &m.attachments,
            Record::Contact(c) => &c.attachments,
            Record::Call(c) => &c.attachments,
        }
    }

    pub fn attachments_mut(&mut self) -> &mut [BlobReference] {
        match self {
            Record::Message(m) => &mut m.attachments,
            Record::Contact(c) => &mut c.attachments,
            Record::Call(c) => &mut c.attachments,
        }
    }

    /// Serializes the record body (without a kind tag; streams are per kind).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        match self {
            Record::Message(m) => serde_json::to_string(m),
            Record::Contact(c) => serde_json::to_string(c),
            Record::Call(c) => serde_json::to_string(c),
        }
    }
}

/// A deduplicated artifact in the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub sha256: String,
    pub size: u64,
    /// Every original path that hashed to this digest, in first-seen order.
    pub original_paths: Vec<String>,
    /// Storage file name: `<sha256>` plus the first original path's extension.
    pub blob_path: String,
}

/// One line of `blobs_manifest.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLine {
    pub case_id: String,
    pub original_path: String,
    pub sha256: Option<String>,
    pub blob_path: Option<String>,
    pub size: Option<u64>,
    pub status: BlobStatus,
    pub related_record_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_mapping() {
        assert_eq!(Direction::from_raw("Incoming"), Direction::Incoming);
        assert_eq!(Direction::from_raw(" outbound "), Direction::Outgoing);
        assert_eq!(Direction::from_raw("Missed"), Direction::Incoming);
        assert_eq!(Direction::from_raw("Outbox"), Direction::Outgoing);
        assert_eq!(Direction::from_raw("sideways"), Direction::Unknown);
        assert_eq!(Direction::from_raw(""), Direction::Unknown);
    }

    #[test]
    fn extension_from_path() {
        assert_eq!(extension_of("media/IMG_001.JPG").as_deref(), Some("jpg"));
        assert_eq!(extension_of("media/archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("media/noext"), None);
        assert_eq!(extension_of("media/.hidden"), None);
        assert_eq!(extension_of("dir.d/file"), None);
    }

    #[test]
    fn new_reference_is_pending() {
        let r = BlobReference::new("attachments/voice.opus".into());
        assert_eq!(r.status, BlobStatus::Pending);
        assert_eq!(r.extension.as_deref(), Some("opus"));
        assert!(r.sha256.is_none());
    }
}
