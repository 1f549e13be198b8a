//! Primary report selection.
//!
//! The canonical report (`report.xml` by default) at the container root wins.
//! Otherwise the first file matching the fallback globs, in sorted
//! relative-path order, is used and a warning is recorded.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::ReportConfig;
use crate::diagnostics::{Diagnostics, Warning, WarningKind};
use crate::error::ContainerError;
use crate::models::{DetectionMethod, ExtractionContainer, ReportDocument};

pub fn locate_report(
    container: &ExtractionContainer,
    config: &ReportConfig,
    diagnostics: &dyn Diagnostics,
) -> Result<ReportDocument, ContainerError> {
    let root = &container.root;

    let canonical = root.join(&config.canonical_name);
    if canonical.is_file() {
        return Ok(ReportDocument {
            path: canonical,
            relative_path: config.canonical_name.replace('\\', "/"),
            method: DetectionMethod::Canonical,
        });
    }

    let family = build_globset(&config.fallback_globs)
        .map_err(|e| ContainerError::InvalidPattern(e.to_string()))?;

    let mut candidates = candidate_files(root, &family)?;
    candidates.sort();

    match candidates.into_iter().next() {
        Some(relative) => {
            diagnostics.warn(Warning::new(
                WarningKind::FallbackReport,
                relative.clone(),
                format!("canonical report missing; using fallback `{}`", relative),
            ));
            Ok(ReportDocument {
                path: root.join(&relative),
                relative_path: relative,
                method: DetectionMethod::Fallback,
            })
        }
        None => Err(ContainerError::NoReportFound { root: root.clone() }),
    }
}

/// Relative, `/`-separated paths of files under `root` matching `family`.
fn candidate_files(root: &Path, family: &GlobSet) -> Result<Vec<String>, ContainerError> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| ContainerError::Staging {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if family.is_match(&rel_str) {
            out.push(rel_str);
        }
    }
    Ok(out)
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingDiagnostics;
    use std::fs;
    use tempfile::TempDir;

    fn container(root: &Path) -> ExtractionContainer {
        ExtractionContainer {
            root: root.to_path_buf(),
            case_id: "C1".into(),
            source_archive: None,
        }
    }

    #[test]
    fn canonical_wins() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("report.xml"), "<r/>").unwrap();
        fs::write(tmp.path().join("a.xml"), "<r/>").unwrap();
        let diag = CollectingDiagnostics::new();
        let doc = locate_report(&container(tmp.path()), &ReportConfig::default(), &diag).unwrap();
        assert_eq!(doc.method, DetectionMethod::Canonical);
        assert_eq!(doc.relative_path, "report.xml");
        assert!(diag.warnings().is_empty());
    }

    #[test]
    fn fallback_is_first_sorted_with_warning() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/zeta.xml"), "<r/>").unwrap();
        fs::write(tmp.path().join("export.xml"), "<r/>").unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        let diag = CollectingDiagnostics::new();
        let doc = locate_report(&container(tmp.path()), &ReportConfig::default(), &diag).unwrap();
        assert_eq!(doc.method, DetectionMethod::Fallback);
        assert_eq!(doc.relative_path, "export.xml");
        let warnings = diag.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::FallbackReport);
        assert_eq!(
            warnings[0].message,
            "canonical report missing; using fallback `export.xml`"
        );
    }

    #[test]
    fn nothing_found_is_fatal() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        let diag = CollectingDiagnostics::new();
        let err =
            locate_report(&container(tmp.path()), &ReportConfig::default(), &diag).unwrap_err();
        assert!(matches!(err, ContainerError::NoReportFound { .. }));
    }
}
