//! TOML configuration for the ingest pipeline.
//!
//! Every section is optional; a missing file at the default location means
//! built-in defaults. CLI flags override values read here.
//!
//! ```toml
//! [pipeline]
//! workers = 4
//! strict = false
//! chunk_size = 65536
//!
//! [report]
//! canonical_name = "report.xml"
//! fallback_globs = ["**/*.xml"]
//!
//! [media]
//! scan = true
//! dirs = ["attachments", "media", "files", "images", "videos"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Size of the blob hashing pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Promote per-blob I/O failures to fatal errors.
    #[serde(default)]
    pub strict: bool,
    /// Read buffer for streaming blobs, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            strict: false,
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_chunk_size() -> usize {
    64 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    #[serde(default = "default_canonical_name")]
    pub canonical_name: String,
    #[serde(default = "default_fallback_globs")]
    pub fallback_globs: Vec<String>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            canonical_name: default_canonical_name(),
            fallback_globs: default_fallback_globs(),
        }
    }
}

fn default_canonical_name() -> String {
    "report.xml".to_string()
}
fn default_fallback_globs() -> Vec<String> {
    vec!["**/*.xml".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// Store files under the media dirs that no record referenced.
    #[serde(default = "default_scan")]
    pub scan: bool,
    #[serde(default = "default_media_dirs")]
    pub dirs: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            scan: default_scan(),
            dirs: default_media_dirs(),
        }
    }
}

fn default_scan() -> bool {
    true
}
fn default_media_dirs() -> Vec<String> {
    ["attachments", "media", "files", "images", "videos"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Loads `path` if it exists; a missing file yields defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be > 0");
    }

    if config.pipeline.chunk_size < 512 {
        anyhow::bail!("pipeline.chunk_size must be >= 512");
    }

    let name = config.report.canonical_name.trim();
    if name.is_empty() || name.contains("..") {
        anyhow::bail!(
            "report.canonical_name must be a plain relative path, got '{}'",
            config.report.canonical_name
        );
    }

    if config.report.fallback_globs.is_empty() {
        anyhow::bail!("report.fallback_globs must list at least one pattern");
    }
    for pattern in &config.report.fallback_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("Invalid report.fallback_globs pattern: '{}'", pattern))?;
    }

    for dir in &config.media.dirs {
        if dir.contains("..") || Path::new(dir).is_absolute() {
            anyhow::bail!("media.dirs entries must be relative, got '{}'", dir);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn empty_file_gives_defaults() {
        let f = write_config("");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.pipeline.workers, 4);
        assert!(!cfg.pipeline.strict);
        assert_eq!(cfg.report.canonical_name, "report.xml");
        assert!(cfg.media.scan);
        assert_eq!(cfg.media.dirs.len(), 5);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let f = write_config("[pipeline]\nstrict = true\n\n[media]\nscan = false\n");
        let cfg = load_config(f.path()).unwrap();
        assert!(cfg.pipeline.strict);
        assert_eq!(cfg.pipeline.chunk_size, 64 * 1024);
        assert!(!cfg.media.scan);
        assert_eq!(cfg.media.dirs[0], "attachments");
    }

    #[test]
    fn zero_workers_rejected() {
        let f = write_config("[pipeline]\nworkers = 0\n");
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn bad_glob_rejected() {
        let f = write_config("[report]\nfallback_globs = [\"a[\"]\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn escaping_media_dir_rejected() {
        let f = write_config("[media]\ndirs = [\"../outside\"]\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.pipeline.workers, 4);
    }
}
