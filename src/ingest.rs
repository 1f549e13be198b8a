//! Ingestion pipeline orchestration.
//!
//! Coordinates one run: container → report → records → blobs → streams →
//! finalize. Blob hashing runs on a fixed-size rayon pool; everything else
//! is a single sequential pass. Nothing is visible under `<out>/<case>/output`
//! until the final swap, so an aborted run leaves the previous output alone.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

use crate::blob::{resolve_attachment, BlobStore};
use crate::config::Config;
use crate::container;
use crate::diagnostics::{Diagnostics, Warning, WarningKind};
use crate::error::{ManifestError, PipelineError, Result};
use crate::extract::{extract_records, normalize_rel_path};
use crate::locate::locate_report;
use crate::manifest::ManifestBuilder;
use crate::models::{BlobReference, BlobStatus, DetectionMethod};
use crate::progress::{IngestProgressEvent, IngestProgressReporter};
use crate::writer::{RecordCounts, StagedOutput};

/// Cooperative cancellation flag, checked between entries and between blobs.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// ZIP container or an already unpacked directory.
    pub input: PathBuf,
    /// Output root; the run writes under `<out_root>/<case_id>/`.
    pub out_root: PathBuf,
    pub case_id: String,
    pub config: Config,
}

/// What a completed run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub case_id: String,
    pub output_dir: PathBuf,
    pub report: String,
    pub report_method: DetectionMethod,
    pub records: RecordCounts,
    /// Attachment references found on records.
    pub references: usize,
    /// Distinct files stored, after dedup.
    pub blobs_stored: usize,
    /// Stores that hit an existing digest.
    pub deduplicated: usize,
    pub unresolved: usize,
    pub failed: usize,
    /// Media files stored without any referencing record.
    pub orphans: usize,
    pub manifest_lines: usize,
    pub warnings: Vec<Warning>,
}

/// One distinct path to hash.
struct BlobJob {
    original_path: String,
    source: Option<PathBuf>,
    orphan: bool,
}

#[derive(Debug, Clone)]
enum BlobOutcome {
    Stored {
        sha256: String,
        sniffed: Option<&'static str>,
    },
    Unresolved,
    Failed,
}

/// Forwards to the caller's sink and keeps a copy for the summary.
struct RunDiagnostics<'a> {
    inner: &'a dyn Diagnostics,
    seen: Mutex<Vec<Warning>>,
}

impl<'a> RunDiagnostics<'a> {
    fn new(inner: &'a dyn Diagnostics) -> Self {
        Self {
            inner,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn into_warnings(self) -> Vec<Warning> {
        self.seen
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Diagnostics for RunDiagnostics<'_> {
    fn warn(&self, warning: Warning) {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(warning.clone());
        self.inner.warn(warning);
    }
}

pub fn run_ingest(
    opts: &IngestOptions,
    diagnostics: &dyn Diagnostics,
    progress: &dyn IngestProgressReporter,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    validate_case_id(&opts.case_id)?;
    let config = &opts.config;
    let case_id = opts.case_id.as_str();
    let case_dir = opts.out_root.join(case_id);
    let diagnostics = RunDiagnostics::new(diagnostics);

    progress.report(IngestProgressEvent::Resolving {
        case_id: case_id.to_string(),
    });
    let container = container::resolve(&opts.input, &case_dir, case_id, &diagnostics)?;
    let report = locate_report(&container, &config.report, &diagnostics)?;
    check_cancel(cancel)?;

    let mut records = extract_records(
        &report.path,
        &report.relative_path,
        case_id,
        &diagnostics,
        cancel,
    )?;
    progress.report(IngestProgressEvent::Extracted {
        case_id: case_id.to_string(),
        records: records.len() as u64,
    });
    tracing::info!(
        case = %case_id,
        report = %report.relative_path,
        records = records.len(),
        "extracted records"
    );

    // Distinct referenced paths in first-reference order, then orphans in path order.
    let mut jobs: Vec<BlobJob> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut references = 0usize;
    for record in &records {
        for reference in record.attachments() {
            references += 1;
            if seen.insert(reference.original_path.clone()) {
                jobs.push(BlobJob {
                    original_path: reference.original_path.clone(),
                    source: resolve_attachment(&container.root, &reference.original_path),
                    orphan: false,
                });
            }
        }
    }
    if config.media.scan {
        for original_path in scan_media(&container.root, &config.media.dirs, &diagnostics) {
            if seen.contains(&original_path) {
                continue;
            }
            let source = Some(container.root.join(&original_path));
            jobs.push(BlobJob {
                original_path,
                source,
                orphan: true,
            });
        }
    }
    for job in jobs.iter().filter(|j| j.source.is_none()) {
        diagnostics.warn(Warning::new(
            WarningKind::UnresolvedBlob,
            job.original_path.clone(),
            "attachment does not resolve to a file inside the container",
        ));
    }

    let staged = StagedOutput::create(&case_dir)?;
    let blobs_dir = staged.blobs_dir();
    let store = BlobStore::new(&blobs_dir, config.pipeline.chunk_size).map_err(|source| {
        ManifestError::Write {
            path: blobs_dir.clone(),
            source,
        }
    })?;

    let outcomes = store_blobs(&jobs, &store, opts, &diagnostics, progress, cancel)?;

    // Fill in reference status from the per-path outcome.
    let by_path: HashMap<&str, &BlobOutcome> = jobs
        .iter()
        .map(|j| j.original_path.as_str())
        .zip(outcomes.iter())
        .collect();
    for record in records.iter_mut() {
        for reference in record.attachments_mut() {
            if let Some(outcome) = by_path.get(reference.original_path.as_str()) {
                apply_outcome(reference, outcome);
            }
        }
    }

    let mut manifest = ManifestBuilder::new(case_id);
    for record in &records {
        for reference in record.attachments() {
            manifest.add(reference, Some(record.id()), &store);
        }
    }
    let mut orphans = 0usize;
    for (job, outcome) in jobs.iter().zip(outcomes.iter()) {
        if !job.orphan {
            continue;
        }
        let mut reference = BlobReference::new(job.original_path.clone());
        apply_outcome(&mut reference, outcome);
        if reference.status == BlobStatus::Stored {
            orphans += 1;
        }
        manifest.add(&reference, None, &store);
    }
    let manifest_lines = manifest.finish();

    check_cancel(cancel)?;
    progress.report(IngestProgressEvent::Writing {
        case_id: case_id.to_string(),
    });
    let counts = staged.write_records(&records)?;
    staged.write_manifest(&manifest_lines)?;
    check_cancel(cancel)?;
    let output_dir = staged.finalize()?;

    let stored = outcomes
        .iter()
        .filter(|o| matches!(o, BlobOutcome::Stored { .. }))
        .count();
    let summary = RunSummary {
        case_id: case_id.to_string(),
        output_dir,
        report: report.relative_path.clone(),
        report_method: report.method,
        records: counts,
        references,
        blobs_stored: store.len(),
        deduplicated: stored.saturating_sub(store.len()),
        unresolved: outcomes
            .iter()
            .filter(|o| matches!(o, BlobOutcome::Unresolved))
            .count(),
        failed: outcomes
            .iter()
            .filter(|o| matches!(o, BlobOutcome::Failed))
            .count(),
        orphans,
        manifest_lines: manifest_lines.len(),
        warnings: diagnostics.into_warnings(),
    };
    tracing::info!(
        case = %summary.case_id,
        output = %summary.output_dir.display(),
        records = summary.records.total(),
        blobs = summary.blobs_stored,
        warnings = summary.warnings.len(),
        "ingest complete"
    );
    Ok(summary)
}

/// Hashes and stores every job on a pool of `pipeline.workers` threads.
///
/// Outcomes come back in job order regardless of completion order.
fn store_blobs(
    jobs: &[BlobJob],
    store: &BlobStore,
    opts: &IngestOptions,
    diagnostics: &dyn Diagnostics,
    progress: &dyn IngestProgressReporter,
    cancel: &CancelToken,
) -> Result<Vec<BlobOutcome>> {
    let strict = opts.config.pipeline.strict;
    let total = jobs.iter().filter(|j| j.source.is_some()).count() as u64;
    let done = AtomicU64::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.config.pipeline.workers)
        .build()?;

    pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                check_cancel(cancel)?;
                let Some(source) = job.source.as_deref() else {
                    return Ok(BlobOutcome::Unresolved);
                };
                let outcome = match store.store(source, &job.original_path) {
                    Ok(blob) => BlobOutcome::Stored {
                        sha256: blob.entry.sha256,
                        sniffed: blob.sniffed_extension,
                    },
                    Err(e) if strict => return Err(PipelineError::Blob(e)),
                    Err(e) => {
                        diagnostics.warn(Warning::new(
                            WarningKind::BlobFailed,
                            job.original_path.clone(),
                            e.to_string(),
                        ));
                        BlobOutcome::Failed
                    }
                };
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                progress.report(IngestProgressEvent::Storing {
                    case_id: opts.case_id.clone(),
                    n,
                    total,
                });
                Ok(outcome)
            })
            .collect::<Result<Vec<_>>>()
    })
}

fn apply_outcome(reference: &mut BlobReference, outcome: &BlobOutcome) {
    match outcome {
        BlobOutcome::Stored { sha256, sniffed } => {
            reference.status = BlobStatus::Stored;
            reference.sha256 = Some(sha256.clone());
            if reference.extension.is_none() {
                reference.extension = sniffed.map(str::to_string);
            }
        }
        BlobOutcome::Unresolved => reference.status = BlobStatus::Unresolved,
        BlobOutcome::Failed => reference.status = BlobStatus::Failed,
    }
}

/// Container-relative paths of every regular file under the media dirs, sorted.
///
/// Subtrees that cannot be read are skipped with a warning.
fn scan_media(root: &Path, dirs: &[String], diagnostics: &dyn Diagnostics) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for dir in dirs {
        let base = root.join(dir);
        if !base.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&base).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let at = e.path().unwrap_or(base.as_path());
                    let context = at
                        .strip_prefix(root)
                        .map(|rel| normalize_rel_path(&rel.to_string_lossy()))
                        .unwrap_or_else(|_| dir.clone());
                    diagnostics.warn(Warning::new(
                        WarningKind::MediaScanFailed,
                        context,
                        e.to_string(),
                    ));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(root) {
                found.push(normalize_rel_path(&rel.to_string_lossy()));
            }
        }
    }
    found.sort();
    found.dedup();
    found
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Case ids become a directory name under the output root.
pub fn validate_case_id(case_id: &str) -> Result<()> {
    let bad = case_id.trim().is_empty()
        || case_id != case_id.trim()
        || case_id.contains(['/', '\\'])
        || case_id.contains("..")
        || case_id.starts_with('.');
    if bad {
        return Err(PipelineError::InvalidCaseId(case_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingDiagnostics;
    use crate::error::BlobIoError;
    use crate::progress::NoProgress;
    use std::fs;
    use tempfile::TempDir;

    fn blob_options(strict: bool) -> IngestOptions {
        let mut config = Config::default();
        config.pipeline.strict = strict;
        config.pipeline.workers = 2;
        IngestOptions {
            input: PathBuf::from("unused"),
            out_root: PathBuf::from("unused"),
            case_id: "CASE-1".into(),
            config,
        }
    }

    /// A job whose file vanished after resolution, next to a readable one.
    fn jobs_with_missing_source(tmp: &Path) -> Vec<BlobJob> {
        fs::write(tmp.join("ok.txt"), b"fine").unwrap();
        vec![
            BlobJob {
                original_path: "media/gone.jpg".into(),
                source: Some(tmp.join("gone.jpg")),
                orphan: false,
            },
            BlobJob {
                original_path: "media/ok.txt".into(),
                source: Some(tmp.join("ok.txt")),
                orphan: false,
            },
        ]
    }

    #[test]
    fn case_id_rules() {
        assert!(validate_case_id("CASE-2024-001").is_ok());
        for bad in ["", "  ", "a/b", "a\\b", "..", "../x", ".hidden", " pad"] {
            assert!(
                matches!(validate_case_id(bad), Err(PipelineError::InvalidCaseId(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn media_scan_is_sorted_and_scoped() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("media/sub")).unwrap();
        fs::create_dir_all(root.join("files")).unwrap();
        fs::create_dir_all(root.join("other")).unwrap();
        fs::write(root.join("media/sub/z.jpg"), b"z").unwrap();
        fs::write(root.join("media/b.png"), b"b").unwrap();
        fs::write(root.join("files/a.pdf"), b"a").unwrap();
        fs::write(root.join("other/ignored.bin"), b"x").unwrap();

        let dirs: Vec<String> = ["media", "files", "videos"].iter().map(|s| s.to_string()).collect();
        let diag = CollectingDiagnostics::new();
        assert_eq!(
            scan_media(root, &dirs, &diag),
            vec!["files/a.pdf", "media/b.png", "media/sub/z.jpg"]
        );
        assert!(diag.warnings().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn media_scan_reports_unreadable_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let locked = root.join("media/locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(root.join("media/a.jpg"), b"a").unwrap();
        fs::write(locked.join("hidden.jpg"), b"h").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permission bits are not enforced for this user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let diag = CollectingDiagnostics::new();
        let found = scan_media(root, &["media".to_string()], &diag);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(found, vec!["media/a.jpg"]);
        let warnings = diag.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::MediaScanFailed);
        assert_eq!(warnings[0].context, "media/locked");
    }

    #[test]
    fn unreadable_blob_is_marked_failed() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::new(tmp.path().join("blobs"), 4096).unwrap();
        let jobs = jobs_with_missing_source(tmp.path());
        let diag = CollectingDiagnostics::new();

        let outcomes = store_blobs(
            &jobs,
            &store,
            &blob_options(false),
            &diag,
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(matches!(outcomes[0], BlobOutcome::Failed));
        assert!(matches!(outcomes[1], BlobOutcome::Stored { .. }));
        let warnings = diag.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::BlobFailed);
        assert_eq!(warnings[0].context, "media/gone.jpg");

        let mut reference = BlobReference::new("media/gone.jpg".into());
        apply_outcome(&mut reference, &outcomes[0]);
        assert_eq!(reference.status, BlobStatus::Failed);
        assert_eq!(reference.sha256, None);

        let mut manifest = ManifestBuilder::new("CASE-1");
        manifest.add(&reference, Some("msg-0001"), &store);
        let lines = manifest.finish();
        assert_eq!(lines[0].status, BlobStatus::Failed);
        assert_eq!(lines[0].blob_path, None);
        assert_eq!(lines[0].related_record_ids, vec!["msg-0001"]);
        let json = serde_json::to_string(&lines[0]).unwrap();
        assert!(json.contains(r#""status":"failed""#), "{}", json);
    }

    #[test]
    fn strict_mode_aborts_on_unreadable_blob() {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::new(tmp.path().join("blobs"), 4096).unwrap();
        let jobs = jobs_with_missing_source(tmp.path());
        let diag = CollectingDiagnostics::new();

        let err = store_blobs(
            &jobs,
            &store,
            &blob_options(true),
            &diag,
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(
            matches!(err, PipelineError::Blob(BlobIoError::ReadFailed { .. })),
            "{:?}",
            err
        );
        assert_eq!(diag.count(WarningKind::BlobFailed), 0);
    }

    #[test]
    fn sniffed_extension_fills_only_missing() {
        let outcome = BlobOutcome::Stored {
            sha256: "ab".into(),
            sniffed: Some("jpg"),
        };
        let mut bare = BlobReference::new("media/noext".into());
        apply_outcome(&mut bare, &outcome);
        assert_eq!(bare.extension.as_deref(), Some("jpg"));
        assert_eq!(bare.status, BlobStatus::Stored);

        let mut named = BlobReference::new("media/photo.heic".into());
        apply_outcome(&mut named, &outcome);
        assert_eq!(named.extension.as_deref(), Some("heic"));
    }
}
