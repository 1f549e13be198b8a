//! Ingest progress reporting.
//!
//! Reports what `ufdr ingest` is doing so users can tell how far a large
//! container has come. Progress is emitted on **stderr** so stdout stays
//! parseable (the run summary is printed there as JSON).

use std::io::Write;

/// A single progress event for one ingest run.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Opening or unpacking the input container.
    Resolving { case_id: String },
    /// The report has been read; `records` entries became records.
    Extracted { case_id: String, records: u64 },
    /// Blob phase: `n` of `total` files hashed and stored.
    Storing { case_id: String, n: u64, total: u64 },
    /// Streams and manifest are being written and swapped into place.
    Writing { case_id: String },
}

/// Reports ingest progress. Called from worker threads during the blob phase.
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest CASE-1  storing  120 / 1,034 blobs".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Resolving { case_id } => {
                format!("ingest {}  resolving container...\n", case_id)
            }
            IngestProgressEvent::Extracted { case_id, records } => {
                format!(
                    "ingest {}  extracted {} records\n",
                    case_id,
                    format_number(*records)
                )
            }
            IngestProgressEvent::Storing { case_id, n, total } => format!(
                "ingest {}  storing  {} / {} blobs\n",
                case_id,
                format_number(*n),
                format_number(*total)
            ),
            IngestProgressEvent::Writing { case_id } => {
                format!("ingest {}  writing output...\n", case_id)
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Resolving { case_id } => serde_json::json!({
                "event": "progress",
                "case_id": case_id,
                "phase": "resolving"
            }),
            IngestProgressEvent::Extracted { case_id, records } => serde_json::json!({
                "event": "progress",
                "case_id": case_id,
                "phase": "extracted",
                "records": records
            }),
            IngestProgressEvent::Storing { case_id, n, total } => serde_json::json!({
                "event": "progress",
                "case_id": case_id,
                "phase": "storing",
                "n": n,
                "total": total
            }),
            IngestProgressEvent::Writing { case_id } => serde_json::json!({
                "event": "progress",
                "case_id": case_id,
                "phase": "writing"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn parse_modes() {
        assert_eq!(ProgressMode::parse("JSON"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
