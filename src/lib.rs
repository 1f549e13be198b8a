//! # UFDR Ingest
//!
//! Turns forensic mobile-extraction containers (Cellebrite-style UFDR
//! archives) into a normalized, auditable corpus: one JSONL stream per
//! record kind (messages, contacts, calls) plus a content-addressed store
//! of every embedded binary, described by a manifest.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────┐
//! │ Container │──▶│ Locator  │──▶│ Extractor │──▶│ Blob store │──▶│  Writer  │
//! │ ZIP / dir │   │report.xml│   │ XML→record│   │ SHA-256    │   │ stage +  │
//! └───────────┘   └──────────┘   └───────────┘   │ rayon pool │   │ swap     │
//!                                                └────────────┘   └──────────┘
//! ```
//!
//! Output for case `C` lands in `<out>/C/output/`:
//! `messages.jsonl`, `contacts.jsonl`, `calls.jsonl`,
//! `blobs_manifest.jsonl` and `blobs/<sha256>[.ext]`. Re-running on the same
//! input produces byte-identical files.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`container`] | Resolve the input into a raw root (unpacking ZIPs) |
//! | [`locate`] | Pick the primary report document |
//! | [`report`] | Streaming XML entry reader |
//! | [`extract`] | Map report entries onto records |
//! | [`timestamp`] | Timestamp and duration parsing |
//! | [`blob`] | Content-addressed blob store |
//! | [`manifest`] | Manifest assembly and verification |
//! | [`writer`] | JSONL streams and atomic finalize |
//! | [`ingest`] | Pipeline orchestration |
//! | [`diagnostics`] | Non-fatal warning sink |
//! | [`progress`] | Progress reporting on stderr |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error types |
//! | [`models`] | Core data types |

pub mod blob;
pub mod config;
pub mod container;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod locate;
pub mod manifest;
pub mod models;
pub mod progress;
pub mod report;
pub mod timestamp;
pub mod writer;
