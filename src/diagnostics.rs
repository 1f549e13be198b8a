//! Non-fatal decisions made during a run.
//!
//! Every component receives a `&dyn Diagnostics` instead of logging through
//! global state. Fallback report selection, skipped entries, unparsed
//! timestamps and unresolved or failed blobs are all reported here, so the
//! run summary can enumerate them and tests can assert on them.

use serde::Serialize;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// The canonical report was missing and another document was used.
    FallbackReport,
    /// An archive entry would have escaped the staging directory.
    UnsafeArchiveEntry,
    /// A report entry was malformed and dropped.
    SkippedEntry,
    /// A timestamp was kept raw in the unmapped bag.
    UnparsedTimestamp,
    /// A numeric field was kept raw in the unmapped bag.
    UnparsedField,
    /// An attachment declared no path; its fields were kept in the unmapped bag.
    AttachmentWithoutPath,
    /// An attachment path did not resolve inside the container.
    UnresolvedBlob,
    /// An attachment could not be read or stored.
    BlobFailed,
    /// Part of a media directory could not be walked for orphan files.
    MediaScanFailed,
}

/// A single non-fatal event with enough context to investigate by hand.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    /// Source path, record locator or blob path the warning is about.
    pub context: String,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            message: message.into(),
        }
    }
}

/// Sink for warnings. Called from worker threads, hence `Send + Sync`.
pub trait Diagnostics: Send + Sync {
    fn warn(&self, warning: Warning);
}

/// Keeps every warning in order and mirrors it to `tracing`.
#[derive(Default)]
pub struct CollectingDiagnostics {
    warnings: Mutex<Vec<Warning>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings
            .lock()
            .map(|w| w.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.warnings().iter().filter(|w| w.kind == kind).count()
    }
}

impl Diagnostics for CollectingDiagnostics {
    fn warn(&self, warning: Warning) {
        tracing::warn!(kind = ?warning.kind, context = %warning.context, "{}", warning.message);
        let mut guard = self
            .warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(warning);
    }
}
