//! Runtime configuration.
//!
//! All settings come from the environment (a `.env` file is loaded in `main`
//! before this runs). Validation happens once at startup so a missing or
//! malformed variable fails fast with a named error instead of surfacing as a
//! dynamic lookup failure mid-batch.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";
const DEFAULT_IMAGES_DIR: &str = "images";
const DEFAULT_DB_PATH: &str = "receipts.db";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_EXTRACT_TIMEOUT_SECS: u64 = 60;

/// Validated application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Process-wide credential for the extraction service. Per-request
    /// overrides supplied by a front end take precedence over this.
    pub api_key: String,
    /// Vision model identifier sent to the extraction service.
    pub model: String,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Default folder scanned by folder-mode ingestion.
    pub images_dir: PathBuf,
    /// Subfolder of `images_dir` that successfully processed images move to.
    pub archive_subdir: String,
    /// Address the HTTP front end binds to.
    pub bind_addr: String,
    /// Upper bound on one extraction call, network time included.
    pub extract_timeout: Duration,
}

impl Config {
    /// Read and validate configuration from the environment.
    pub fn from_env() -> PipelineResult<Self> {
        let api_key = require_var("OPENROUTER_API_KEY")?;

        let timeout_secs = match std::env::var("EXTRACT_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                PipelineError::invalid_value(
                    "EXTRACT_TIMEOUT_SECS",
                    format!("not a positive integer: {raw:?}"),
                )
            })?,
            Err(_) => DEFAULT_EXTRACT_TIMEOUT_SECS,
        };

        Ok(Self {
            api_key,
            model: var_or("EXTRACT_MODEL", DEFAULT_MODEL),
            db_path: PathBuf::from(var_or("RECEIPTS_DB", DEFAULT_DB_PATH)),
            images_dir: PathBuf::from(var_or("IMAGES_DIR", DEFAULT_IMAGES_DIR)),
            archive_subdir: var_or("ARCHIVE_SUBDIR", "archive"),
            bind_addr: var_or("BIND_ADDR", DEFAULT_BIND_ADDR),
            extract_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Absolute archive folder for a given source folder.
    pub fn archive_dir_for(&self, source_dir: &std::path::Path) -> PathBuf {
        source_dir.join(&self.archive_subdir)
    }
}

fn require_var(name: &'static str) -> PipelineResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PipelineError::MissingConfig(name)),
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
