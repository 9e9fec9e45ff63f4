//! Pipeline configuration
//!
//! Everything tunable arrives from flags or the environment; credentials are
//! never hardcoded. Validation failures abort the run before any file is
//! touched (exit code 2 at the CLI).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::uploader::RetryPolicy;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_STAGING_TABLE: &str = "parcels_staging";
pub const DEFAULT_TRANSFER_FN: &str = "transfer_staged_parcels";

/// Hard cap on workers, so a wide host cannot exhaust the staging service's
/// connection limits
pub const MAX_WORKERS: usize = 8;

/// Worker count derived from CPU parallelism, clamped to `[1, MAX_WORKERS]`
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_WORKERS)
}

/// Connection settings for the external staging service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base URL of the service (e.g., `https://acme.example.co`)
    pub base_url: String,
    /// API key, sent as both `apikey` header and bearer token
    pub api_key: String,
    /// Staging table that accepts raw bulk-inserted rows
    pub staging_table: String,
    /// Stored procedure that moves staged rows into production
    pub transfer_fn: String,
    /// Per-request timeout, separate from retry scheduling
    pub request_timeout: Duration,
}

/// Full pipeline configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Directory scanned for `*.csv` source files
    pub source_dir: PathBuf,
    /// Directory completed files are moved into
    pub archive_dir: PathBuf,
    /// Parallel file workers (1 = sequential)
    pub workers: usize,
    /// Records per bulk-insert batch
    pub batch_size: usize,
    /// Upload retry/backoff policy
    pub retry: RetryPolicy,
    /// Staging service connection settings
    pub service: ServiceConfig,
}

impl IngestConfig {
    /// Load configuration entirely from the environment
    ///
    /// - `PARCELS_SOURCE_DIR` (required)
    /// - `PARCELS_ARCHIVE_DIR` (default `<source>/imported`)
    /// - `PARCELS_SERVICE_URL`, `PARCELS_SERVICE_KEY` (required)
    /// - `PARCELS_STAGING_TABLE`, `PARCELS_TRANSFER_FN`
    /// - `PARCELS_WORKERS`, `PARCELS_BATCH_SIZE`, `PARCELS_MAX_RETRIES`,
    ///   `PARCELS_BACKOFF_BASE_MS`, `PARCELS_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        let source_dir = PathBuf::from(require_env("PARCELS_SOURCE_DIR")?);
        let archive_dir = std::env::var("PARCELS_ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| source_dir.join("imported"));

        let config = Self {
            archive_dir,
            workers: parse_env("PARCELS_WORKERS", default_worker_count())?,
            batch_size: parse_env("PARCELS_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            retry: RetryPolicy {
                max_attempts: parse_env("PARCELS_MAX_RETRIES", DEFAULT_MAX_ATTEMPTS)?,
                backoff_base: Duration::from_millis(parse_env(
                    "PARCELS_BACKOFF_BASE_MS",
                    DEFAULT_BACKOFF_BASE_MS,
                )?),
            },
            service: ServiceConfig {
                base_url: require_env("PARCELS_SERVICE_URL")?,
                api_key: require_env("PARCELS_SERVICE_KEY")?,
                staging_table: std::env::var("PARCELS_STAGING_TABLE")
                    .unwrap_or_else(|_| DEFAULT_STAGING_TABLE.to_string()),
                transfer_fn: std::env::var("PARCELS_TRANSFER_FN")
                    .unwrap_or_else(|_| DEFAULT_TRANSFER_FN.to_string()),
                request_timeout: Duration::from_secs(parse_env(
                    "PARCELS_REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                )?),
            },
            source_dir,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check startup invariants. Called before any file is processed.
    pub fn validate(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.source_dir).map_err(|_| {
            IngestError::config(format!(
                "source directory does not exist: {}",
                self.source_dir.display()
            ))
        })?;
        if !meta.is_dir() {
            return Err(IngestError::config(format!(
                "source path is not a directory: {}",
                self.source_dir.display()
            )));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("batch size must be at least 1"));
        }
        if self.workers == 0 {
            return Err(IngestError::config("worker count must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::config("max retries must be at least 1"));
        }
        if self.service.base_url.trim().is_empty() {
            return Err(IngestError::config(
                "service URL is not set (PARCELS_SERVICE_URL)",
            ));
        }
        if self.service.api_key.trim().is_empty() {
            return Err(IngestError::config(
                "service API key is not set (PARCELS_SERVICE_KEY)",
            ));
        }
        Ok(())
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| IngestError::config(format!("{key} is not set")))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| IngestError::config(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}
