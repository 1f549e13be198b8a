//! # UFDR ingest CLI (`ufdr`)
//!
//! Turns a forensic extraction container into normalized record streams and
//! a content-addressed blob store, and re-verifies a finished store.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ufdr ingest <input> --case <id> --out <dir>` | Ingest a container (ZIP or directory) |
//! | `ufdr verify <manifest> <blobs-dir>` | Re-hash stored blobs against a manifest |
//!
//! ## Examples
//!
//! ```bash
//! ufdr ingest ./phone.ufdr --case CASE-2024-001 --out ./cases
//! ufdr ingest ./unpacked/ --case CASE-2024-001 --out ./cases --strict --workers 8
//! ufdr verify ./cases/CASE-2024-001/output/blobs_manifest.jsonl ./cases/CASE-2024-001/output/blobs
//! ```
//!
//! The run summary (ingest) or verification report (verify) is printed to
//! stdout as JSON. Logs and progress go to stderr; set `RUST_LOG` to adjust.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ufdr_ingest::config;
use ufdr_ingest::diagnostics::CollectingDiagnostics;
use ufdr_ingest::ingest::{run_ingest, CancelToken, IngestOptions};
use ufdr_ingest::manifest::verify_manifest;
use ufdr_ingest::progress::ProgressMode;

#[derive(Parser)]
#[command(
    name = "ufdr",
    about = "Ingest forensic extraction containers into JSONL record streams and a content-addressed blob store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ufdr.toml`; when that file does not exist the
    /// built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/ufdr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one container.
    ///
    /// Writes `messages.jsonl`, `contacts.jsonl`, `calls.jsonl`,
    /// `blobs_manifest.jsonl` and `blobs/` under `<out>/<case>/output/`,
    /// replacing the previous output only once the run has succeeded.
    Ingest {
        /// UFDR archive (ZIP) or an already unpacked directory.
        input: PathBuf,

        /// Case identifier; becomes the directory name under `--out`.
        #[arg(long = "case")]
        case_id: String,

        /// Output root.
        #[arg(long)]
        out: PathBuf,

        /// Fail the run on any blob read/write error.
        #[arg(long)]
        strict: bool,

        /// Blob hashing threads (overrides `pipeline.workers`).
        #[arg(long)]
        workers: Option<usize>,

        /// Progress on stderr: `off`, `human`, or `json`. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Verify stored blobs against a manifest.
    ///
    /// Exits non-zero if any blob is missing or no longer matches its digest.
    Verify {
        manifest: PathBuf,
        blobs_dir: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Ingest {
            input,
            case_id,
            out,
            strict,
            workers,
            progress,
        } => {
            if strict {
                cfg.pipeline.strict = true;
            }
            if let Some(n) = workers {
                cfg.pipeline.workers = n;
            }
            config::validate(&cfg)?;

            let mode = match progress.as_deref() {
                Some(raw) => match ProgressMode::parse(raw) {
                    Some(mode) => mode,
                    None => bail!("unknown --progress mode '{}': use off, human, or json", raw),
                },
                None => ProgressMode::default_for_tty(),
            };

            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("interrupt received; stopping before output is replaced");
                handler_token.cancel();
            })
            .context("failed to install Ctrl-C handler")?;

            let opts = IngestOptions {
                input,
                out_root: out,
                case_id,
                config: cfg,
            };
            let diagnostics = CollectingDiagnostics::new();
            let reporter = mode.reporter();
            let summary = run_ingest(&opts, &diagnostics, reporter.as_ref(), &cancel)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Verify {
            manifest,
            blobs_dir,
        } => {
            let report = verify_manifest(&manifest, &blobs_dir, cfg.pipeline.chunk_size)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                bail!(
                    "verification failed: {} missing, {} mismatched",
                    report.missing.len(),
                    report.mismatched.len()
                );
            }
        }
    }

    Ok(())
}
