//! Parcels Ingest - bulk CSV ingestion CLI

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parcels_common::format::format_bytes;
use parcels_common::logging::{init_logging, LogConfig, LogLevel};
use parcels_ingest::config::{
    default_worker_count, IngestConfig, ServiceConfig, DEFAULT_BACKOFF_BASE_MS,
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_STAGING_TABLE, DEFAULT_TRANSFER_FN,
};
use parcels_ingest::pipeline::{discover_files, Pipeline};
use parcels_ingest::store::{RestStore, StagingStore};
use parcels_ingest::uploader::RetryPolicy;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// All files completed
const EXIT_OK: u8 = 0;
/// One or more files ended failed
const EXIT_FAILED_FILES: u8 = 1;
/// Configuration or startup error
const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "parcels-ingest")]
#[command(author, version, about = "Bulk CSV ingestion pipeline for county parcel extracts")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest all pending source files through staging into production
    Run(RunArgs),

    /// List pending source files without contacting the staging service
    Scan {
        /// Directory containing source CSV files
        #[arg(long, env = "PARCELS_SOURCE_DIR")]
        source_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory containing source CSV files
    #[arg(long, env = "PARCELS_SOURCE_DIR")]
    source_dir: PathBuf,

    /// Directory completed files are moved into (default: <source-dir>/imported)
    #[arg(long, env = "PARCELS_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    /// Parallel file workers, 1 = sequential (default: CPU count, capped)
    #[arg(long, env = "PARCELS_WORKERS")]
    workers: Option<usize>,

    /// Records per bulk-insert batch
    #[arg(long, env = "PARCELS_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Total upload attempts per batch, including the first
    #[arg(long, env = "PARCELS_MAX_RETRIES", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_retries: u32,

    /// Base backoff delay in milliseconds (doubles per attempt)
    #[arg(long, env = "PARCELS_BACKOFF_BASE_MS", default_value_t = DEFAULT_BACKOFF_BASE_MS)]
    backoff_base_ms: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "PARCELS_REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    /// Base URL of the staging service
    #[arg(long, env = "PARCELS_SERVICE_URL")]
    service_url: String,

    /// API key for the staging service
    #[arg(long, env = "PARCELS_SERVICE_KEY", hide_env_values = true)]
    service_key: String,

    /// Staging table name
    #[arg(long, env = "PARCELS_STAGING_TABLE", default_value = DEFAULT_STAGING_TABLE)]
    staging_table: String,

    /// Stored procedure that transfers staged rows into production
    #[arg(long, env = "PARCELS_TRANSFER_FN", default_value = DEFAULT_TRANSFER_FN)]
    transfer_fn: String,
}

impl RunArgs {
    fn into_config(self) -> IngestConfig {
        let archive_dir = self
            .archive_dir
            .unwrap_or_else(|| self.source_dir.join("imported"));
        IngestConfig {
            archive_dir,
            workers: self.workers.unwrap_or_else(default_worker_count),
            batch_size: self.batch_size,
            retry: RetryPolicy {
                max_attempts: self.max_retries,
                backoff_base: Duration::from_millis(self.backoff_base_ms),
            },
            service: ServiceConfig {
                base_url: self.service_url,
                api_key: self.service_key,
                staging_table: self.staging_table,
                transfer_fn: self.transfer_fn,
                request_timeout: Duration::from_secs(self.request_timeout_secs),
            },
            source_dir: self.source_dir,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("parcels-ingest")
        .build();
    // Each PARCELS_LOG_* variable that is set overrides its flag-derived
    // field; unset variables leave the flags in effect.
    let log_config = match log_config.apply_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid logging configuration: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(err) = init_logging(&log_config) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Scan { source_dir } => cmd_scan(&source_dir).await,
    }
}

async fn cmd_run(args: RunArgs) -> ExitCode {
    let config = args.into_config();

    match prepare(&config).await {
        Ok(store) => {
            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight work before exit");
                    signal_token.cancel();
                }
            });

            let pipeline = Pipeline::new(config, store).with_progress_bar(true);
            match pipeline.run(cancel).await {
                Ok(summary) => {
                    info!(
                        files_completed = summary.files_completed,
                        files_failed = summary.files_failed,
                        files_skipped = summary.files_skipped,
                        records_staged = summary.records_staged,
                        records_malformed = summary.records_malformed,
                        records_failed = summary.records_failed,
                        throughput = format!("{:.1} records/s", summary.records_per_sec()),
                        "run summary"
                    );
                    if summary.all_completed() {
                        ExitCode::from(EXIT_OK)
                    } else {
                        eprintln!("{} file(s) failed:", summary.failures.len());
                        for failure in &summary.failures {
                            eprintln!("  {}: {}", failure.file, failure.reason);
                        }
                        ExitCode::from(EXIT_FAILED_FILES)
                    }
                }
                Err(err) => {
                    error!(error = %err, "ingest run aborted");
                    eprintln!("{err}");
                    ExitCode::from(EXIT_CONFIG)
                }
            }
        }
        Err(err) => {
            error!(error = %err, "startup failed");
            eprintln!("{err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// Validate configuration and make sure the staging service is reachable
/// before any file is touched
async fn prepare(config: &IngestConfig) -> Result<Arc<RestStore>> {
    config.validate().context("invalid configuration")?;
    let store = RestStore::new(&config.service).context("could not build service client")?;
    store
        .health_check()
        .await
        .context("staging service is unreachable")?;
    Ok(Arc::new(store))
}

async fn cmd_scan(source_dir: &PathBuf) -> ExitCode {
    match discover_files(source_dir).await {
        Ok(files) => {
            let total: u64 = files.iter().map(|f| f.size).sum();
            for file in &files {
                println!("{:>10}  {}", format_bytes(file.size), file.name());
            }
            println!("{} pending file(s), {}", files.len(), format_bytes(total));
            ExitCode::from(EXIT_OK)
        }
        Err(err) => {
            eprintln!("scan failed: {err}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
