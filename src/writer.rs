//! Record streams, manifest, and the stage-then-swap finalize.
//!
//! Everything a run produces is written into a hidden staging directory
//! under `<out>/<case>/`. Only [`StagedOutput::finalize`] makes it visible,
//! by renaming the staged `output/` over the previous one. Dropping a
//! `StagedOutput` without finalizing deletes the staging directory, so a
//! failed run leaves the earlier output exactly as it was.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::error::ManifestError;
use crate::models::{ManifestLine, Record, RecordKind};

pub const OUTPUT_DIR: &str = "output";
pub const BLOBS_DIR: &str = "blobs";
pub const MANIFEST_FILE: &str = "blobs_manifest.jsonl";

const STAGING_PREFIX: &str = ".staging-";
const PREVIOUS_DIR: &str = "previous";

/// Records written per stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub messages: usize,
    pub contacts: usize,
    pub calls: usize,
}

impl RecordCounts {
    fn bump(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Message => self.messages += 1,
            RecordKind::Contact => self.contacts += 1,
            RecordKind::Call => self.calls += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.messages + self.contacts + self.calls
    }
}

pub struct StagedOutput {
    case_dir: PathBuf,
    staging: TempDir,
    output: PathBuf,
}

impl StagedOutput {
    /// Creates a fresh staging directory under `case_dir`.
    ///
    /// Staging directories left behind by killed runs are removed first. A
    /// run killed between the two finalize renames leaves `output/` missing
    /// and the previous output under `<staging>/previous`; that copy is moved
    /// back before anything is deleted.
    pub fn create(case_dir: &Path) -> Result<Self, ManifestError> {
        fs::create_dir_all(case_dir).map_err(|source| write_err(case_dir, source))?;
        restore_interrupted_swap(case_dir)?;
        remove_stale_staging(case_dir);

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(case_dir)
            .map_err(|source| write_err(case_dir, source))?;
        let output = staging.path().join(OUTPUT_DIR);
        let blobs = output.join(BLOBS_DIR);
        fs::create_dir_all(&blobs).map_err(|source| write_err(&blobs, source))?;

        Ok(Self {
            case_dir: case_dir.to_path_buf(),
            staging,
            output,
        })
    }

    /// Staged `output/` directory.
    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.output.join(BLOBS_DIR)
    }

    /// Writes every record to its kind's stream, in the order given.
    ///
    /// All three streams are created even when a kind has no records.
    pub fn write_records(&self, records: &[Record]) -> Result<RecordCounts, ManifestError> {
        let mut messages = JsonlWriter::create(&self.output.join(RecordKind::Message.stream_file()))?;
        let mut contacts = JsonlWriter::create(&self.output.join(RecordKind::Contact.stream_file()))?;
        let mut calls = JsonlWriter::create(&self.output.join(RecordKind::Call.stream_file()))?;

        let mut counts = RecordCounts::default();
        for record in records {
            let line = record.to_json_line()?;
            let writer = match record.kind() {
                RecordKind::Message => &mut messages,
                RecordKind::Contact => &mut contacts,
                RecordKind::Call => &mut calls,
            };
            writer.write_line(&line)?;
            counts.bump(record.kind());
        }

        messages.finish()?;
        contacts.finish()?;
        calls.finish()?;
        Ok(counts)
    }

    pub fn write_manifest(&self, lines: &[ManifestLine]) -> Result<(), ManifestError> {
        let mut writer = JsonlWriter::create(&self.output.join(MANIFEST_FILE))?;
        for line in lines {
            writer.write_line(&serde_json::to_string(line)?)?;
        }
        writer.finish()
    }

    /// Swaps the staged output into `<case>/output` and returns its path.
    ///
    /// The previous output is moved into the staging directory first and
    /// deleted along with it. If the second rename fails the previous output
    /// is moved back.
    pub fn finalize(self) -> Result<PathBuf, ManifestError> {
        let target = self.case_dir.join(OUTPUT_DIR);
        let previous = self.staging.path().join(PREVIOUS_DIR);

        let had_previous = target.exists();
        if had_previous {
            fs::rename(&target, &previous).map_err(|source| finalize_err(&target, source))?;
        }

        if let Err(source) = fs::rename(&self.output, &target) {
            if had_previous {
                if let Err(e) = fs::rename(&previous, &target) {
                    tracing::error!(
                        path = %target.display(),
                        error = %e,
                        "could not restore previous output"
                    );
                }
            }
            return Err(finalize_err(&target, source));
        }

        tracing::debug!(output = %target.display(), replaced = had_previous, "output finalized");
        // Dropping `staging` removes the previous output.
        Ok(target)
    }
}

fn stale_staging_dirs(case_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(case_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn restore_interrupted_swap(case_dir: &Path) -> Result<(), ManifestError> {
    let target = case_dir.join(OUTPUT_DIR);
    if target.exists() {
        return Ok(());
    }
    let Some(previous) = stale_staging_dirs(case_dir)
        .into_iter()
        .map(|dir| dir.join(PREVIOUS_DIR))
        .find(|p| p.is_dir())
    else {
        return Ok(());
    };

    tracing::warn!(
        from = %previous.display(),
        to = %target.display(),
        "restoring output left behind by an interrupted run"
    );
    fs::rename(&previous, &target).map_err(|source| finalize_err(&target, source))
}

fn remove_stale_staging(case_dir: &Path) {
    for dir in stale_staging_dirs(case_dir) {
        tracing::debug!(path = %dir.display(), "removing stale staging directory");
        let _ = fs::remove_dir_all(&dir);
    }
}

/// Buffered newline-delimited JSON writer.
struct JsonlWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlWriter {
    fn create(path: &Path) -> Result<Self, ManifestError> {
        let file = File::create(path).map_err(|source| write_err(path, source))?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }

    fn write_line(&mut self, line: &str) -> Result<(), ManifestError> {
        self.out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.write_all(b"\n"))
            .map_err(|source| write_err(&self.path, source))
    }

    fn finish(mut self) -> Result<(), ManifestError> {
        self.out
            .flush()
            .and_then(|_| self.out.get_ref().sync_all())
            .map_err(|source| write_err(&self.path, source))
    }
}

fn write_err(path: &Path, source: std::io::Error) -> ManifestError {
    ManifestError::Write {
        path: path.to_path_buf(),
        source,
    }
}

fn finalize_err(path: &Path, source: std::io::Error) -> ManifestError {
    ManifestError::Finalize {
        path: path.to_path_buf(),
        source,
    }
}
