//! Parcels Common Library
//!
//! Shared utilities for the parcels ingestion workspace:
//!
//! - **Logging**: centralized tracing setup (console/file, text/JSON)
//! - **Formatting**: human-readable bytes, durations, and rates for
//!   progress reporting

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod format;
pub mod logging;
