//! Run-wide progress aggregation
//!
//! Workers never touch shared counters. They send [`ProgressDelta`] messages
//! over a channel to a single aggregator task that owns every counter,
//! periodically logs aggregate progress with a moving-rate throughput and
//! ETA, and yields the final [`RunSummary`] once all senders hang up.

use indicatif::{ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parcels_common::format::{format_duration, format_rate};

const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Incremental progress reported by workers. Deltas, not absolute values,
/// so the aggregator is the only place totals exist.
#[derive(Debug)]
pub enum ProgressDelta {
    FileStarted { file: String },
    /// Rows rejected for a field-count mismatch while reading one file
    RowsMalformed { count: u64 },
    BatchStaged { records: u64 },
    BatchFailed { records: u64 },
    FileCompleted { file: String, bytes: u64 },
    FileFailed { file: String, bytes: u64, reason: String },
    /// File interrupted by cancellation before reaching a terminal state;
    /// left in the source directory, not a failure
    FileSkipped { file: String },
}

/// Cloneable sender side handed to every worker
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<ProgressDelta>,
}

impl ProgressHandle {
    /// Fire-and-forget; progress is advisory telemetry, so a closed
    /// aggregator is not an error worth surfacing
    pub fn send(&self, delta: ProgressDelta) {
        let _ = self.tx.send(delta);
    }
}

/// One failed file and the reason it failed
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileFailure {
    pub file: String,
    pub reason: String,
}

/// Final accounting for one pipeline run
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub files_total: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    /// Files interrupted by cancellation, still pending in the source dir
    pub files_skipped: usize,
    pub records_staged: u64,
    pub records_malformed: u64,
    /// Records in batches that exhausted their retries
    pub records_failed: u64,
    pub batches_staged: u64,
    pub batches_failed: u64,
    pub elapsed: Duration,
    pub failures: Vec<FileFailure>,
}

impl RunSummary {
    /// Empty summary for a run that found no files
    pub fn empty() -> Self {
        Self {
            files_total: 0,
            files_completed: 0,
            files_failed: 0,
            files_skipped: 0,
            records_staged: 0,
            records_malformed: 0,
            records_failed: 0,
            batches_staged: 0,
            batches_failed: 0,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    pub fn all_completed(&self) -> bool {
        self.files_failed == 0
    }

    /// Overall staged-records throughput for the whole run
    pub fn records_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.records_staged as f64 / secs
        } else {
            0.0
        }
    }
}

/// Sliding-window rate estimator: rate improves as the run progresses
/// instead of being skewed by a slow start
pub(crate) struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RateWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub(crate) fn push(&mut self, at: Instant, total: u64) {
        self.samples.push_back((at, total));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(t, _)) if at.duration_since(t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Units per second across the window, once two samples exist
    pub(crate) fn rate(&self) -> Option<f64> {
        let (first_t, first_v) = *self.samples.front()?;
        let (last_t, last_v) = *self.samples.back()?;
        let secs = last_t.duration_since(first_t).as_secs_f64();
        if secs <= 0.0 || last_v <= first_v {
            return None;
        }
        Some((last_v - first_v) as f64 / secs)
    }
}

/// Create the progress channel and its aggregator for one run
pub fn progress_channel(
    total_files: usize,
    total_bytes: u64,
    show_bar: bool,
) -> (ProgressHandle, ProgressAggregator) {
    let (tx, rx) = mpsc::unbounded_channel();
    let bar = show_bar.then(|| {
        let pb = ProgressBar::new(total_bytes);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    });

    let aggregator = ProgressAggregator {
        rx,
        files_total: total_files,
        bytes_total: total_bytes,
        bytes_done: 0,
        files_completed: 0,
        files_failed: 0,
        files_skipped: 0,
        records_staged: 0,
        records_malformed: 0,
        records_failed: 0,
        batches_staged: 0,
        batches_failed: 0,
        failures: Vec::new(),
        record_rate: RateWindow::new(RATE_WINDOW),
        byte_rate: RateWindow::new(RATE_WINDOW),
        started: Instant::now(),
        bar,
    };

    (ProgressHandle { tx }, aggregator)
}

/// Counter-owning task; the only mutator of run statistics
pub struct ProgressAggregator {
    rx: mpsc::UnboundedReceiver<ProgressDelta>,
    files_total: usize,
    bytes_total: u64,
    bytes_done: u64,
    files_completed: usize,
    files_failed: usize,
    files_skipped: usize,
    records_staged: u64,
    records_malformed: u64,
    records_failed: u64,
    batches_staged: u64,
    batches_failed: u64,
    failures: Vec<FileFailure>,
    record_rate: RateWindow,
    byte_rate: RateWindow,
    started: Instant,
    bar: Option<ProgressBar>,
}

impl ProgressAggregator {
    /// Consume deltas until every [`ProgressHandle`] is dropped, then return
    /// the final summary
    pub async fn run(mut self) -> RunSummary {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + REPORT_INTERVAL,
            REPORT_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(delta) => self.apply(delta),
                    None => break,
                },
                _ = ticker.tick() => self.report(),
            }
        }

        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }

        RunSummary {
            files_total: self.files_total,
            files_completed: self.files_completed,
            files_failed: self.files_failed,
            files_skipped: self.files_skipped,
            records_staged: self.records_staged,
            records_malformed: self.records_malformed,
            records_failed: self.records_failed,
            batches_staged: self.batches_staged,
            batches_failed: self.batches_failed,
            elapsed: self.started.elapsed(),
            failures: self.failures,
        }
    }

    fn apply(&mut self, delta: ProgressDelta) {
        let now = Instant::now();
        match delta {
            ProgressDelta::FileStarted { file } => {
                debug!(file, "file claimed");
            }
            ProgressDelta::RowsMalformed { count } => {
                self.records_malformed += count;
            }
            ProgressDelta::BatchStaged { records } => {
                self.batches_staged += 1;
                self.records_staged += records;
                self.record_rate.push(now, self.records_staged);
            }
            ProgressDelta::BatchFailed { records } => {
                self.batches_failed += 1;
                self.records_failed += records;
            }
            ProgressDelta::FileCompleted { file, bytes } => {
                self.files_completed += 1;
                self.bytes_done += bytes;
                self.byte_rate.push(now, self.bytes_done);
                if let Some(bar) = &self.bar {
                    bar.inc(bytes);
                    bar.set_message(format!(
                        "{}/{} files",
                        self.files_completed + self.files_failed,
                        self.files_total
                    ));
                }
                info!(file, "file completed");
            }
            ProgressDelta::FileFailed {
                file,
                bytes,
                reason,
            } => {
                self.files_failed += 1;
                self.bytes_done += bytes;
                self.byte_rate.push(now, self.bytes_done);
                if let Some(bar) = &self.bar {
                    bar.inc(bytes);
                }
                warn!(file, reason, "file failed");
                self.failures.push(FileFailure { file, reason });
            }
            ProgressDelta::FileSkipped { file } => {
                self.files_skipped += 1;
                info!(file, "file skipped, left in source directory");
            }
        }
    }

    fn report(&self) {
        let throughput = self
            .record_rate
            .rate()
            .map(|r| format_rate(r, "records"))
            .unwrap_or_else(|| "n/a".to_string());
        let eta = self
            .byte_rate
            .rate()
            .filter(|r| *r > 0.0)
            .map(|r| {
                let remaining = self.bytes_total.saturating_sub(self.bytes_done) as f64;
                format_duration(Duration::from_secs_f64(remaining / r))
            })
            .unwrap_or_else(|| "n/a".to_string());

        info!(
            files_done = self.files_completed + self.files_failed,
            files_total = self.files_total,
            records_staged = self.records_staged,
            records_malformed = self.records_malformed,
            batches_failed = self.batches_failed,
            throughput = %throughput,
            eta = %eta,
            "ingest progress"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aggregator_accumulates_deltas() {
        let (handle, aggregator) = progress_channel(3, 100, false);

        handle.send(ProgressDelta::FileStarted {
            file: "a.csv".to_string(),
        });
        handle.send(ProgressDelta::BatchStaged { records: 10 });
        handle.send(ProgressDelta::BatchStaged { records: 5 });
        handle.send(ProgressDelta::RowsMalformed { count: 2 });
        handle.send(ProgressDelta::FileCompleted {
            file: "a.csv".to_string(),
            bytes: 60,
        });
        handle.send(ProgressDelta::BatchFailed { records: 7 });
        handle.send(ProgressDelta::FileFailed {
            file: "b.csv".to_string(),
            bytes: 40,
            reason: "1 of 1 batches permanently failed".to_string(),
        });
        handle.send(ProgressDelta::FileSkipped {
            file: "c.csv".to_string(),
        });
        drop(handle);

        let summary = aggregator.run().await;
        assert_eq!(summary.files_total, 3);
        assert_eq!(summary.files_completed, 1);
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.records_staged, 15);
        assert_eq!(summary.records_malformed, 2);
        // Records in exhausted batches are counted as failed, not dropped.
        assert_eq!(summary.records_failed, 7);
        assert_eq!(summary.batches_staged, 2);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].file, "b.csv");
        assert!(!summary.all_completed());
    }

    #[tokio::test]
    async fn test_cloned_handles_feed_one_aggregator() {
        let (handle, aggregator) = progress_channel(1, 0, false);
        let second = handle.clone();

        handle.send(ProgressDelta::BatchStaged { records: 3 });
        second.send(ProgressDelta::BatchStaged { records: 4 });
        drop(handle);
        drop(second);

        let summary = aggregator.run().await;
        assert_eq!(summary.records_staged, 7);
        assert_eq!(summary.batches_staged, 2);
    }

    #[test]
    fn test_rate_window_moving_rate() {
        let mut window = RateWindow::new(Duration::from_secs(60));
        let start = Instant::now();

        assert!(window.rate().is_none());
        window.push(start, 0);
        window.push(start + Duration::from_secs(10), 1000);

        let rate = window.rate().unwrap();
        assert!((rate - 100.0).abs() < 1.0);
    }

    #[test]
    fn test_rate_window_evicts_old_samples() {
        let mut window = RateWindow::new(Duration::from_secs(5));
        let start = Instant::now();

        window.push(start, 0);
        window.push(start + Duration::from_secs(1), 10);
        window.push(start + Duration::from_secs(20), 1000);
        // Old samples fall out; the rate reflects recent progress only.
        assert!(window.samples.len() <= 2);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RunSummary::empty();
        assert!(summary.all_completed());
        assert_eq!(summary.records_per_sec(), 0.0);
    }
}
