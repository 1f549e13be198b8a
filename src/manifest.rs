//! Manifest assembly and verification.
//!
//! [`ManifestBuilder`] turns blob references into `blobs_manifest.jsonl`
//! lines: one line per distinct original path, in the order paths were
//! first referenced, with the ids of every record that pointed at it.
//! [`verify_manifest`] re-hashes a finished store against its manifest.

use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::blob::{sha256_file, BlobStore};
use crate::error::ManifestError;
use crate::models::{BlobReference, BlobStatus, ManifestLine};

pub struct ManifestBuilder {
    case_id: String,
    lines: Vec<ManifestLine>,
    by_path: HashMap<String, usize>,
}

impl ManifestBuilder {
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            lines: Vec::new(),
            by_path: HashMap::new(),
        }
    }

    /// Adds `reference` on behalf of `record_id` (`None` for orphan media).
    ///
    /// Digest, size and storage name come from the store's final index entry,
    /// since a later store of the same content can rename the blob file.
    pub fn add(&mut self, reference: &BlobReference, record_id: Option<&str>, store: &BlobStore) {
        let idx = match self.by_path.get(&reference.original_path) {
            Some(&idx) => idx,
            None => {
                let stored = reference
                    .sha256
                    .as_deref()
                    .filter(|_| reference.status == BlobStatus::Stored)
                    .and_then(|sha| store.entry(sha));
                let line = ManifestLine {
                    case_id: self.case_id.clone(),
                    original_path: reference.original_path.clone(),
                    sha256: stored.as_ref().map(|e| e.sha256.clone()),
                    blob_path: stored.as_ref().map(|e| format!("blobs/{}", e.blob_path)),
                    size: stored.as_ref().map(|e| e.size),
                    status: reference.status,
                    related_record_ids: Vec::new(),
                };
                self.lines.push(line);
                let idx = self.lines.len() - 1;
                self.by_path.insert(reference.original_path.clone(), idx);
                idx
            }
        };

        if let Some(id) = record_id {
            let related = &mut self.lines[idx].related_record_ids;
            if !related.iter().any(|r| r == id) {
                related.push(id.to_string());
            }
        }
    }

    pub fn contains(&self, original_path: &str) -> bool {
        self.by_path.contains_key(original_path)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn finish(self) -> Vec<ManifestLine> {
        self.lines
    }
}

/// Outcome of [`verify_manifest`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyReport {
    /// Lines whose blob exists and re-hashes to the recorded digest.
    pub verified: usize,
    /// Lines with no digest (unresolved or failed references).
    pub skipped: usize,
    /// Original paths whose blob file is missing.
    pub missing: Vec<String>,
    /// Original paths whose blob no longer matches its digest.
    pub mismatched: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Re-hashes every stored blob listed in `manifest` under `blobs_dir`.
pub fn verify_manifest(
    manifest: &Path,
    blobs_dir: &Path,
    chunk_size: usize,
) -> Result<VerifyReport, ManifestError> {
    let read_failed = |source| ManifestError::Read {
        path: manifest.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(manifest).map_err(read_failed)?);

    let mut report = VerifyReport::default();
    for line in reader.lines() {
        let line = line.map_err(read_failed)?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: ManifestLine = serde_json::from_str(&line)?;
        let (Some(sha256), Some(blob_path)) = (&entry.sha256, &entry.blob_path) else {
            report.skipped += 1;
            continue;
        };

        let path = blob_file(blobs_dir, blob_path);
        if !path.is_file() {
            report.missing.push(entry.original_path);
            continue;
        }
        match sha256_file(&path, chunk_size) {
            Ok((actual, _)) if actual == *sha256 => report.verified += 1,
            Ok(_) => report.mismatched.push(entry.original_path),
            Err(source) => return Err(ManifestError::Read { path, source }),
        }
    }
    Ok(report)
}

/// `blob_path` is relative to the output directory (`blobs/<name>`).
fn blob_file(blobs_dir: &Path, blob_path: &str) -> PathBuf {
    let name = blob_path.rsplit('/').next().unwrap_or(blob_path);
    blobs_dir.join(name)
}
