//! Parcels Ingest Library
//!
//! Bulk CSV ingestion pipeline for county parcel extracts: streams
//! multi-gigabyte delimited files, batches rows, bulk-inserts each batch into
//! a remote staging table with retry and backoff, transfers staged rows into
//! production, and archives completed source files.
//!
//! # Pipeline layers
//!
//! - [`parser`]: quote-aware streaming CSV reader producing normalized records
//! - [`batcher`]: bounded-memory grouping of records into fixed-size batches
//! - [`uploader`]: per-batch bulk insert with exponential backoff retry
//! - [`pipeline`]: file discovery, worker pool, transfer, and archival
//!
//! # Example
//!
//! ```no_run
//! use parcels_ingest::config::IngestConfig;
//! use parcels_ingest::pipeline::Pipeline;
//! use parcels_ingest::store::RestStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let store = Arc::new(RestStore::new(&config.service)?);
//!     let summary = Pipeline::new(config, store)
//!         .run(CancellationToken::new())
//!         .await?;
//!     println!("staged {} records", summary.records_staged);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod batcher;
pub mod config;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod store;
pub mod uploader;

pub use error::{IngestError, Result};
