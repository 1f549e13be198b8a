//! Error taxonomy for the ingest pipeline.
//!
//! | Type | Severity |
//! |------|----------|
//! | [`ContainerError`] | fatal: bad input, corrupt archive, no usable report |
//! | [`ParseError`] | per entry: the entry is skipped, the run continues |
//! | [`BlobIoError`] | per blob: the reference is marked failed (fatal in strict mode) |
//! | [`ManifestError`] | fatal: outputs could not be written or finalized |
//!
//! [`PipelineError`] is what [`crate::ingest::run_ingest`] returns; only fatal
//! conditions ever reach it.

use std::path::PathBuf;

/// Problems with the input container or its report document.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("input not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("cannot read archive {}: {message}", path.display())]
    CorruptArchive { path: PathBuf, message: String },

    #[error("no report document found under {}", root.display())]
    NoReportFound { root: PathBuf },

    #[error("report {} is not well-formed XML at byte {position}: {message}", path.display())]
    ReportSyntax {
        path: PathBuf,
        position: u64,
        message: String,
    },

    #[error("invalid report pattern: {0}")]
    InvalidPattern(String),

    #[error("staging I/O failed at {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single report entry that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("entry {locator} has no fields")]
    EmptyEntry { locator: String },

    #[error("entry {locator} holds bare text instead of fields")]
    Unstructured { locator: String },
}

/// Failure to read a source blob or persist it into the store.
#[derive(Debug, thiserror::Error)]
pub enum BlobIoError {
    #[error("failed to read blob {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write blob {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to produce or finalize the output streams.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to move output into place at {}: {source}", path.display())]
    Finalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal outcome of an ingest run. Outputs from earlier runs are untouched.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("strict mode: {0}")]
    Blob(#[from] BlobIoError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("invalid case id {0:?}: must be non-empty and contain no path separators")]
    InvalidCaseId(String),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
