//! Pipeline orchestrator
//!
//! Discovers source files, drives parse → batch → upload per file across a
//! bounded worker pool, invokes the staging→production transfer once a file's
//! batches are all staged, and archives completed files.
//!
//! The filesystem is the only persisted state: a file still in the source
//! directory has not been ingested; a file in the archive directory has. A
//! completed file is *moved* (atomic rename), never copied or deleted, so no
//! code path can lose source data. Failed files are left in place untouched
//! for the next run.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batcher::Batcher;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::parser::RecordStream;
use crate::progress::{progress_channel, ProgressDelta, ProgressHandle, RunSummary};
use crate::store::StagingStore;
use crate::uploader::{upload_batch, BatchOutcome, RetryPolicy};

/// Per-file processing state. Terminal states are final for a run; a failed
/// file is retried only by re-invoking the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FileState {
    pub fn as_str(&self) -> &str {
        match self {
            FileState::Pending => "pending",
            FileState::InProgress => "in_progress",
            FileState::Completed => "completed",
            FileState::Failed => "failed",
        }
    }
}

/// One discovered source file
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size: u64,
    pub discovered_at: DateTime<Utc>,
    pub state: FileState,
}

impl SourceFile {
    /// File name for logs and progress reporting
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Scan a directory for `*.csv` files, sorted by filename so run order is
/// deterministic and logs are reproducible
pub async fn discover_files(dir: &Path) -> Result<Vec<SourceFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_csv = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if !is_csv || !entry.file_type().await?.is_file() {
            continue;
        }
        let size = entry.metadata().await?.len();
        files.push(SourceFile {
            path,
            size,
            discovered_at: Utc::now(),
            state: FileState::Pending,
        });
    }

    files.sort_by_key(|f| f.path.file_name().map(|n| n.to_owned()));
    Ok(files)
}

#[derive(Clone)]
struct WorkerCtx {
    store: Arc<dyn StagingStore>,
    batch_size: usize,
    retry: RetryPolicy,
    archive_dir: PathBuf,
    progress: ProgressHandle,
    cancel: CancellationToken,
}

/// Drives one ingestion run end to end
pub struct Pipeline {
    config: IngestConfig,
    store: Arc<dyn StagingStore>,
    show_progress: bool,
}

impl Pipeline {
    pub fn new(config: IngestConfig, store: Arc<dyn StagingStore>) -> Self {
        Self {
            config,
            store,
            show_progress: false,
        }
    }

    /// Render an interactive progress bar during the run (CLI mode)
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Run the pipeline until every discovered file reaches a terminal state
    /// or cancellation stops scheduling
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            source_dir = %self.config.source_dir.display(),
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            "starting ingest run"
        );

        let files = discover_files(&self.config.source_dir).await?;
        if files.is_empty() {
            info!(source_dir = %self.config.source_dir.display(), "no source files found");
            return Ok(RunSummary::empty());
        }

        tokio::fs::create_dir_all(&self.config.archive_dir).await?;

        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        let worker_count = self.config.workers.min(files.len());
        info!(
            files = files.len(),
            total_bytes, worker_count, "discovered source files"
        );

        let (progress, aggregator) =
            progress_channel(files.len(), total_bytes, self.show_progress);
        let aggregator = tokio::spawn(aggregator.run());

        let queue = Arc::new(Mutex::new(VecDeque::from(files)));
        let ctx = WorkerCtx {
            store: self.store.clone(),
            batch_size: self.config.batch_size,
            retry: self.config.retry,
            archive_dir: self.config.archive_dir.clone(),
            progress,
            cancel,
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let queue = queue.clone();
            let ctx = ctx.clone();
            workers.spawn(worker_loop(worker_id, queue, ctx));
        }
        // The aggregator finishes once every handle is gone; the workers hold
        // the remaining clones.
        drop(ctx);

        while let Some(joined) = workers.join_next().await {
            joined.map_err(|e| IngestError::Task(e.to_string()))?;
        }

        let summary = aggregator
            .await
            .map_err(|e| IngestError::Task(e.to_string()))?;

        info!(
            run_id = %run_id,
            files_completed = summary.files_completed,
            files_failed = summary.files_failed,
            files_skipped = summary.files_skipped,
            records_staged = summary.records_staged,
            records_malformed = summary.records_malformed,
            records_failed = summary.records_failed,
            batches_failed = summary.batches_failed,
            elapsed_secs = summary.elapsed.as_secs(),
            "ingest run finished"
        );
        Ok(summary)
    }
}

fn pop_file(queue: &Mutex<VecDeque<SourceFile>>) -> Option<SourceFile> {
    let mut guard = match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.pop_front()
}

async fn worker_loop(worker_id: usize, queue: Arc<Mutex<VecDeque<SourceFile>>>, ctx: WorkerCtx) {
    loop {
        if ctx.cancel.is_cancelled() {
            debug!(worker_id, "cancellation requested, worker stopping");
            break;
        }
        let Some(mut file) = pop_file(&queue) else {
            debug!(worker_id, "no files left, worker stopping");
            break;
        };
        file.state = FileState::InProgress;
        info!(worker_id, file = %file.name(), size = file.size, "claimed file");
        process_file(&ctx, file).await;
    }
}

fn fail_file(ctx: &WorkerCtx, file: &mut SourceFile, reason: String) {
    file.state = FileState::Failed;
    ctx.progress.send(ProgressDelta::FileFailed {
        file: file.name(),
        bytes: file.size,
        reason,
    });
}

fn report_malformed(ctx: &WorkerCtx, batcher: &Batcher) {
    if batcher.malformed() > 0 {
        ctx.progress.send(ProgressDelta::RowsMalformed {
            count: batcher.malformed(),
        });
    }
}

/// Stream one file through parse → batch → upload, then transfer and archive.
/// Batches within a file run strictly in file order; failures are converted
/// to a file-level outcome, never propagated to sibling workers.
async fn process_file(ctx: &WorkerCtx, mut file: SourceFile) {
    let name = file.name();
    ctx.progress.send(ProgressDelta::FileStarted {
        file: name.clone(),
    });

    let stream = match RecordStream::open(&file.path).await {
        Ok(stream) => stream,
        Err(err) => {
            fail_file(ctx, &mut file, format!("could not open file: {err}"));
            return;
        }
    };

    let mut batcher = Batcher::new(stream, ctx.batch_size);
    let mut batch_number = 0u64;
    let mut failed_batches = 0u64;
    let mut cancelled = false;

    loop {
        // Cancellation stops scheduling new batches; the in-flight batch
        // already finished cleanly by the time we get here.
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        match batcher.next_batch().await {
            Ok(Some(batch)) => {
                batch_number += 1;
                let header = batcher.header().clone();
                let outcome = upload_batch(
                    ctx.store.as_ref(),
                    &header,
                    &batch,
                    &ctx.retry,
                    &ctx.progress,
                    &name,
                    batch_number,
                )
                .await;
                if let BatchOutcome::PermanentlyFailed { .. } = outcome {
                    failed_batches += 1;
                }
            }
            Ok(None) => break,
            Err(err) => {
                report_malformed(ctx, &batcher);
                fail_file(ctx, &mut file, format!("read error: {err}"));
                return;
            }
        }
    }

    report_malformed(ctx, &batcher);

    if cancelled {
        // Not a failure: the file stays pending in the source directory and
        // the next run picks it up from the start.
        warn!(file = %name, "run cancelled, leaving file in source directory");
        file.state = FileState::Pending;
        ctx.progress.send(ProgressDelta::FileSkipped { file: name });
        return;
    }

    if failed_batches > 0 {
        fail_file(
            ctx,
            &mut file,
            format!("{failed_batches} of {batch_number} batches permanently failed"),
        );
        return;
    }

    // Transfer is a required step: all-staged but not transferred is still a
    // failed file. Staged rows stay behind; the transfer procedure is
    // idempotent so the re-run cannot duplicate production rows.
    match ctx.store.transfer_staged().await {
        Ok(moved) => {
            debug!(file = %name, moved, "staged rows transferred to production");
        }
        Err(err) => {
            fail_file(ctx, &mut file, format!("staging transfer failed: {err}"));
            return;
        }
    }

    let dest = match file.path.file_name() {
        Some(base) => ctx.archive_dir.join(base),
        None => {
            fail_file(ctx, &mut file, "file has no base name".to_string());
            return;
        }
    };
    if let Err(err) = tokio::fs::rename(&file.path, &dest).await {
        fail_file(ctx, &mut file, format!("archive move failed: {err}"));
        return;
    }

    file.state = FileState::Completed;
    info!(
        file = %name,
        records = batcher.records_seen(),
        state = file.state.as_str(),
        "file completed and archived"
    );
    ctx.progress.send(ProgressDelta::FileCompleted {
        file: name,
        bytes: file.size,
    });
}
