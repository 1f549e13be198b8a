//! Content-addressable blob store.
//!
//! Each source file is streamed once in fixed-size chunks: the bytes are
//! hashed with SHA-256 and copied into a temporary file inside the store.
//! The dedup index is then consulted under a lock. A known digest discards
//! the temporary; a new one is renamed to `<sha256>[.ext]` and indexed.
//!
//! Storage names are deterministic under parallel stores: when the same
//! content arrives under several extensions, the name with an extension
//! that sorts first wins and the stored file is renamed to it.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::BlobIoError;
use crate::models::{extension_of, BlobEntry};

/// Bytes inspected for content sniffing.
const SNIFF_LEN: usize = 16;

/// Result of a single [`BlobStore::store`] call.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub entry: BlobEntry,
    /// True when the digest was already present in the store.
    pub deduplicated: bool,
    /// Extension guessed from the leading bytes.
    pub sniffed_extension: Option<&'static str>,
}

pub struct BlobStore {
    dir: PathBuf,
    chunk_size: usize,
    index: Mutex<HashMap<String, BlobEntry>>,
}

impl BlobStore {
    /// Opens a store rooted at `dir`, creating it if needed. The index starts empty.
    pub fn new(dir: impl Into<PathBuf>, chunk_size: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            chunk_size: chunk_size.max(1),
            index: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Streams `source` into the store. `original_path` is the container-relative path.
    pub fn store(&self, source: &Path, original_path: &str) -> Result<StoredBlob, BlobIoError> {
        let read_failed = |source_err: io::Error| BlobIoError::ReadFailed {
            path: source.to_path_buf(),
            source: source_err,
        };
        let write_failed = |path: &Path, source_err: io::Error| BlobIoError::WriteFailed {
            path: path.to_path_buf(),
            source: source_err,
        };

        let mut input = File::open(source).map_err(read_failed)?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| write_failed(&self.dir, e))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
        let mut size = 0u64;
        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_failed(e)),
            };
            let chunk = &buf[..n];
            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(n);
                head.extend_from_slice(&chunk[..take]);
            }
            hasher.update(chunk);
            tmp.write_all(chunk).map_err(|e| write_failed(tmp.path(), e))?;
            size += n as u64;
        }
        tmp.flush().map_err(|e| write_failed(tmp.path(), e))?;

        let sha256 = format!("{:x}", hasher.finalize());
        let blob_path = storage_name(&sha256, extension_of(original_path).as_deref());
        let sniffed_extension = sniff_extension(&head);

        let mut index = self
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = index.get_mut(&sha256) {
            if let Err(at) = existing
                .original_paths
                .binary_search_by(|p| p.as_str().cmp(original_path))
            {
                existing.original_paths.insert(at, original_path.to_string());
            }
            if prefer_name(&blob_path, &existing.blob_path) {
                let from = self.dir.join(&existing.blob_path);
                let to = self.dir.join(&blob_path);
                fs::rename(&from, &to).map_err(|e| write_failed(&to, e))?;
                existing.blob_path = blob_path;
            }
            // `tmp` is dropped here, deleting the duplicate copy.
            return Ok(StoredBlob {
                entry: existing.clone(),
                deduplicated: true,
                sniffed_extension,
            });
        }

        let dest = self.dir.join(&blob_path);
        tmp.persist(&dest)
            .map_err(|e| write_failed(&dest, e.error))?;
        let entry = BlobEntry {
            sha256: sha256.clone(),
            size,
            original_paths: vec![original_path.to_string()],
            blob_path,
        };
        index.insert(sha256, entry.clone());
        tracing::debug!(blob = %entry.blob_path, size, source = %original_path, "stored blob");

        Ok(StoredBlob {
            entry,
            deduplicated: false,
            sniffed_extension,
        })
    }

    /// Current index entry for `sha256`.
    pub fn entry(&self, sha256: &str) -> Option<BlobEntry> {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(sha256)
            .cloned()
    }

    /// All entries, ordered by digest.
    pub fn entries(&self) -> Vec<BlobEntry> {
        let index = self
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out: Vec<BlobEntry> = index.values().cloned().collect();
        out.sort_by(|a, b| a.sha256.cmp(&b.sha256));
        out
    }

    pub fn len(&self) -> usize {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn storage_name(sha256: &str, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => format!("{}.{}", sha256, ext),
        None => sha256.to_string(),
    }
}

/// Names with an extension beat bare digests; otherwise the smaller name wins.
fn prefer_name(candidate: &str, current: &str) -> bool {
    let has_ext = |name: &str| name.contains('.');
    match (has_ext(candidate), has_ext(current)) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate < current,
    }
}

/// Resolves a container-relative attachment path to a regular file inside `root`.
///
/// Returns `None` for missing files and for paths that escape the root.
pub fn resolve_attachment(root: &Path, original_path: &str) -> Option<PathBuf> {
    if original_path.is_empty() {
        return None;
    }
    let canonical_root = root.canonicalize().ok()?;
    let candidate = root.join(original_path).canonicalize().ok()?;
    (candidate.starts_with(&canonical_root) && candidate.is_file()).then_some(candidate)
}

/// Guesses a file extension from leading magic bytes.
pub fn sniff_extension(head: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\xFF\xD8\xFF" as &[u8], "jpg"),
        (b"\x89PNG\r\n\x1A\n" as &[u8], "png"),
        (b"GIF87a" as &[u8], "gif"),
        (b"GIF89a" as &[u8], "gif"),
        (b"%PDF-" as &[u8], "pdf"),
        (b"PK\x03\x04" as &[u8], "zip"),
        (b"OggS" as &[u8], "ogg"),
        (b"#!AMR" as &[u8], "amr"),
    ];
    if let Some((_, ext)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return Some(*ext);
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some("mp4");
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"WEBP" {
        return Some("webp");
    }
    None
}

/// SHA-256 and byte length of a file, read in `chunk_size` chunks.
pub fn sha256_file(path: &Path, chunk_size: usize) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut size = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
