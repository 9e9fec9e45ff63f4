//! Batch uploader with retry and exponential backoff
//!
//! Persists one batch at a time to the staging store. The JSON payload is
//! built once per batch and reused across attempts, so a retried upload is
//! byte-for-byte the batch that failed. A batch that exhausts its attempts is
//! permanently failed: counted, reported, and skipped, while the rest of the
//! file keeps going.

use std::time::Duration;
use tracing::{debug, error, warn};

use crate::progress::{ProgressDelta, ProgressHandle};
use crate::record::{Header, JsonMap, Record};
use crate::store::StagingStore;
use std::sync::Arc;

/// Retry schedule for bulk-insert attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each attempt after that
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based):
    /// `base * 2^(attempt-1)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Final outcome of uploading one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Batch landed in the staging table
    Staged { records: u64 },
    /// Retries exhausted; records counted as failed, file continues
    PermanentlyFailed { records: u64 },
}

/// Upload one batch, retrying transient failures with exponential backoff.
///
/// Progress counters are updated exactly once, on the final outcome, never on
/// intermediate retries, so they stay monotonic.
pub async fn upload_batch(
    store: &dyn StagingStore,
    header: &Arc<Header>,
    batch: &[Record],
    policy: &RetryPolicy,
    progress: &ProgressHandle,
    file: &str,
    batch_number: u64,
) -> BatchOutcome {
    let payload: Vec<JsonMap> = batch.iter().map(|r| r.to_json(header)).collect();
    let records = batch.len() as u64;

    let mut attempt = 1u32;
    loop {
        match store.bulk_insert(&payload).await {
            Ok(()) => {
                debug!(file, batch_number, records, attempt, "batch staged");
                progress.send(ProgressDelta::BatchStaged { records });
                return BatchOutcome::Staged { records };
            }
            Err(err) if attempt >= policy.max_attempts => {
                error!(
                    file,
                    batch_number,
                    records,
                    attempts = attempt,
                    error = %err,
                    "batch permanently failed"
                );
                progress.send(ProgressDelta::BatchFailed { records });
                return BatchOutcome::PermanentlyFailed { records };
            }
            Err(err) => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    file,
                    batch_number,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "bulk insert failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::progress::progress_channel;
    use crate::store::testing::MockStore;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        }
    }

    fn test_batch() -> (Arc<Header>, Vec<Record>) {
        let header = Arc::new(Header::from_raw(["parcel_id", "owner"]));
        let batch = vec![
            Record::from_fields(["001", "Smith"]),
            Record::from_fields(["002", ""]),
        ];
        (header, batch)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_makes_one_call() {
        let store = MockStore::default();
        let (handle, _agg) = progress_channel(1, 0, false);
        let (header, batch) = test_batch();

        let outcome =
            upload_batch(&store, &header, &batch, &test_policy(), &handle, "f.csv", 1).await;

        assert_eq!(outcome, BatchOutcome::Staged { records: 2 });
        assert_eq!(store.insert_calls(), 1);
    }

    #[tokio::test]
    async fn test_fail_twice_then_succeed_makes_three_calls() {
        let store = MockStore::failing_first(2);
        let (handle, _agg) = progress_channel(1, 0, false);
        let (header, batch) = test_batch();

        let outcome =
            upload_batch(&store, &header, &batch, &test_policy(), &handle, "f.csv", 1).await;

        assert_eq!(outcome, BatchOutcome::Staged { records: 2 });
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn test_always_failing_store_exhausts_exactly_max_attempts() {
        let store = MockStore::failing_first(u64::MAX);
        let (handle, _agg) = progress_channel(1, 0, false);
        let (header, batch) = test_batch();

        let outcome =
            upload_batch(&store, &header, &batch, &test_policy(), &handle, "f.csv", 1).await;

        assert_eq!(outcome, BatchOutcome::PermanentlyFailed { records: 2 });
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_resends_identical_payload() {
        let store = MockStore::failing_first(1);
        let (handle, _agg) = progress_channel(1, 0, false);
        let (header, batch) = test_batch();

        let expected: Vec<JsonMap> = batch.iter().map(|r| r.to_json(&header)).collect();
        upload_batch(&store, &header, &batch, &test_policy(), &handle, "f.csv", 1).await;

        let staged = store.staged_batches();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0], expected);
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_base: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(20));
    }
}
