//! Container resolution: archive or directory in, raw root out.
//!
//! A directory input is used in place. A file input is treated as a ZIP
//! archive (UFDR containers are ZIPs) and streamed entry by entry into
//! `<out>/<case>/raw/`, which is wiped first so stale files from an earlier
//! run never leak into this one.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::diagnostics::{Diagnostics, Warning, WarningKind};
use crate::error::ContainerError;
use crate::models::ExtractionContainer;

/// Name of the staging directory that receives unpacked archives.
pub const RAW_DIR: &str = "raw";

pub fn resolve(
    input: &Path,
    case_dir: &Path,
    case_id: &str,
    diagnostics: &dyn Diagnostics,
) -> Result<ExtractionContainer, ContainerError> {
    if !input.exists() {
        return Err(ContainerError::NotFound {
            path: input.to_path_buf(),
        });
    }

    if input.is_dir() {
        tracing::debug!(root = %input.display(), "using unpacked container directory");
        return Ok(ExtractionContainer {
            root: input.to_path_buf(),
            case_id: case_id.to_string(),
            source_archive: None,
        });
    }

    let raw_dir = case_dir.join(RAW_DIR);
    reset_dir(&raw_dir)?;
    let unpacked = unpack_zip(input, &raw_dir, diagnostics)?;
    tracing::info!(
        archive = %input.display(),
        entries = unpacked,
        raw = %raw_dir.display(),
        "unpacked container"
    );

    Ok(ExtractionContainer {
        root: raw_dir,
        case_id: case_id.to_string(),
        source_archive: Some(input.to_path_buf()),
    })
}

fn reset_dir(dir: &Path) -> Result<(), ContainerError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|source| staging(dir, source))?;
    }
    fs::create_dir_all(dir).map_err(|source| staging(dir, source))
}

fn staging(path: &Path, source: io::Error) -> ContainerError {
    ContainerError::Staging {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, e: impl ToString) -> ContainerError {
    ContainerError::CorruptArchive {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Streams every entry of `archive` into `dest`. Returns the number of files written.
fn unpack_zip(
    archive: &Path,
    dest: &Path,
    diagnostics: &dyn Diagnostics,
) -> Result<usize, ContainerError> {
    let file = File::open(archive).map_err(|e| corrupt(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| corrupt(archive, e))?;

    let mut written = 0usize;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| corrupt(archive, e))?;

        // Absolute names and `..` components would land outside the staging root.
        let relative: PathBuf = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                diagnostics.warn(Warning::new(
                    WarningKind::UnsafeArchiveEntry,
                    entry.name().to_string(),
                    "archive entry escapes the staging directory; skipped",
                ));
                continue;
            }
        };
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|source| staging(&target, source))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| staging(parent, source))?;
        }
        let mut out = File::create(&target).map_err(|source| staging(&target, source))?;
        // A read error here is a decode/CRC failure in the archive itself.
        io::copy(&mut entry, &mut out).map_err(|e| {
            corrupt(
                archive,
                format!("entry {}: {}", relative.display(), e),
            )
        })?;
        written += 1;
    }

    Ok(written)
}
