//! Staging store capability
//!
//! The pipeline never talks to the backing service directly; it goes through
//! the [`StagingStore`] trait so the transport can be swapped (or mocked in
//! tests). [`RestStore`] is the production implementation: a PostgREST-style
//! REST surface with a bulk-insert endpoint per table and stored procedures
//! exposed under `/rpc/`.

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::record::JsonMap;

/// Transport-level error from the staging service. The uploader treats every
/// variant as transient and retryable.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Request timed out (counts toward the retry limit like any failure)
    #[error("Request timed out")]
    Timeout,

    /// HTTP transport failure (connect, TLS, body read)
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    /// The service answered with a non-success status
    #[error("Service returned {code}: {body}")]
    Status { code: u16, body: String },
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Http(err)
        }
    }
}

/// Bulk-insert and transfer capability of the external staging store
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Insert one batch of records into the staging table. All-or-nothing:
    /// on error the whole batch is assumed not inserted.
    async fn bulk_insert(&self, records: &[JsonMap]) -> Result<(), StoreError>;

    /// Move/validate/deduplicate staged rows into the production table via
    /// the external stored procedure. Returns the row count it reports.
    /// The procedure is upsert-based, so re-invoking after a failed run does
    /// not duplicate production rows.
    async fn transfer_staged(&self) -> Result<u64, StoreError>;

    /// Cheap reachability probe, used at startup so an unreachable service
    /// fails the run before any file is touched
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// PostgREST-style staging store over HTTP
pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
    staging_table: String,
    transfer_fn: String,
}

impl RestStore {
    /// Build a store client from service configuration. The per-request
    /// timeout lives on the client, separate from the uploader's retry
    /// schedule, so a hung connection cannot block a worker indefinitely.
    pub fn new(config: &ServiceConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent("parcels-ingest/0.1")
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            staging_table: config.staging_table.clone(),
            transfer_fn: config.transfer_fn.clone(),
        })
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl StagingStore for RestStore {
    async fn bulk_insert(&self, records: &[JsonMap]) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{}", self.base_url, self.staging_table);
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(&records)
            .send()
            .await?;

        Self::check_status(response).await?;
        debug!(records = records.len(), table = %self.staging_table, "batch staged");
        Ok(())
    }

    async fn transfer_staged(&self) -> Result<u64, StoreError> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, self.transfer_fn);
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let response = Self::check_status(response).await?;

        // The procedure returns the moved row count as a bare JSON number;
        // a void-returning variant yields an empty body.
        let body = response.text().await.unwrap_or_default();
        let moved = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(moved)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        Self::check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod testing {
    //! In-process store double for unit tests

    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Scriptable [`StagingStore`]: fails the first `fail_inserts` bulk
    /// inserts, then succeeds; records every payload it accepts.
    #[derive(Default)]
    pub struct MockStore {
        pub fail_inserts: u64,
        pub fail_transfer: bool,
        pub cancel_on_insert: Option<CancellationToken>,
        insert_calls: AtomicU64,
        transfer_calls: AtomicU64,
        staged: Mutex<Vec<Vec<JsonMap>>>,
    }

    impl MockStore {
        pub fn failing_first(fail_inserts: u64) -> Self {
            Self {
                fail_inserts,
                ..Self::default()
            }
        }

        pub fn failing_transfer() -> Self {
            Self {
                fail_transfer: true,
                ..Self::default()
            }
        }

        /// Cancel `token` as a side effect of every accepted insert, to
        /// simulate an operator interrupt arriving mid-file
        pub fn cancelling_on_insert(token: CancellationToken) -> Self {
            Self {
                cancel_on_insert: Some(token),
                ..Self::default()
            }
        }

        pub fn insert_calls(&self) -> u64 {
            self.insert_calls.load(Ordering::SeqCst)
        }

        pub fn transfer_calls(&self) -> u64 {
            self.transfer_calls.load(Ordering::SeqCst)
        }

        /// Every successfully staged batch, in call order
        pub fn staged_batches(&self) -> Vec<Vec<JsonMap>> {
            self.staged.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StagingStore for MockStore {
        async fn bulk_insert(&self, records: &[JsonMap]) -> Result<(), StoreError> {
            let call = self.insert_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_inserts {
                return Err(StoreError::Status {
                    code: 503,
                    body: "service unavailable".to_string(),
                });
            }
            self.staged.lock().unwrap().push(records.to_vec());
            if let Some(token) = &self.cancel_on_insert {
                token.cancel();
            }
            Ok(())
        }

        async fn transfer_staged(&self) -> Result<u64, StoreError> {
            self.transfer_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_transfer {
                return Err(StoreError::Status {
                    code: 500,
                    body: "transfer procedure failed".to_string(),
                });
            }
            Ok(0)
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }
}
