//! Run orchestration: discovery, bounded worker pool, cancellation and the
//! optional upload phase.
//!
//! The scheduler owns the phase machine and is the only component that
//! advances it. Workers pull [`WorkItem`]s from a bounded MPMC queue, run
//! one [`RetryableTask`] per job and report straight onto the progress
//! channel. `Done` is always the last message of a run; a run that found
//! nothing sends `NothingToDo` instead.

use super::progress::ProgressSender;
use super::scanner::{DiscoveredFile, ImageScanner};
use super::state::{RunPhase, RunState, RunTracker};
use super::task::{BackoffPolicy, RetryableTask};
use super::transcoder::{ImageTranscoder, Transcoder};
use super::{CancellationFlag, CompressionJob};
use crate::error::RunError;
use crate::upload::{ProcessUploader, UploadHandoff, UploadRequest, UploadResult, Uploader};
use crate::utils::config::CompressorConfig;
use crate::utils::run_log::RunLog;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CANCELED_MESSAGE: &str = "Compression process canceled by user.";
pub const CANCELING_MESSAGE: &str = "Canceling compression process...";

#[derive(Debug)]
enum WorkItem {
    Job(CompressionJob),
    Shutdown,
}

/// Final account of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub total_discovered: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub never_started: usize,
    pub upload: Option<UploadResult>,
    pub upload_error: Option<String>,
    #[serde(with = "crate::utils::config::duration_str")]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_failed(&self) -> bool {
        self.phase == RunPhase::Failed
    }
}

/// Everything a worker needs; shared by all workers of a run.
struct WorkerContext {
    transcoder: Arc<dyn Transcoder>,
    progress: ProgressSender,
    tracker: RunTracker,
    log: RunLog,
    max_retries: u32,
    backoff: BackoffPolicy,
}

pub struct JobScheduler {
    config: CompressorConfig,
    transcoder: Arc<dyn Transcoder>,
    uploader: Arc<dyn Uploader>,
    progress: ProgressSender,
    cancel: CancellationFlag,
    tracker: RunTracker,
    run_id: Uuid,
}

impl JobScheduler {
    /// Scheduler wired to the real codec and the child-process uploader.
    pub fn new(config: CompressorConfig, progress: ProgressSender) -> Self {
        let uploader = Arc::new(ProcessUploader::from_config(&config));
        Self {
            config,
            transcoder: Arc::new(ImageTranscoder::new()),
            uploader,
            progress,
            cancel: CancellationFlag::new(),
            tracker: RunTracker::new(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> RunTracker {
        self.tracker.clone()
    }

    /// Move the run onto the tokio runtime.
    pub fn spawn(self) -> RunHandle {
        let canceler = RunCanceler {
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            tracker: self.tracker.clone(),
        };
        let handle = tokio::spawn(async move { self.run().await });

        RunHandle { canceler, handle }
    }

    /// Execute one run to a terminal phase.
    ///
    /// Setup failures (unusable source or output directory) end the run as
    /// `Failed` and are returned as errors after being reported on the
    /// channel. Per-file and upload failures are part of the summary.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        if self.tracker.phase() != RunPhase::Idle {
            return Err(RunError::AlreadyStarted);
        }

        let started = Instant::now();
        let source_dir = self.config.source_dir.clone();
        if source_dir.as_os_str().is_empty() {
            return Err(self.abort(RunError::EmptySourceDir, None));
        }

        self.tracker.transition(RunPhase::Discovering)?;
        info!("Run {} started for {}", self.run_id, source_dir.display());

        let log = match self.prepare(&source_dir).await {
            Ok(log) => log,
            Err(e) => return Err(self.abort(e, None)),
        };
        log.info(format!(
            "Compressing images in {} to {} (JPEG quality {}, PNG level {})",
            source_dir.display(),
            self.config.output_format,
            self.config.jpeg_quality,
            self.config.png_compression
        ));

        let files = match ImageScanner::from_config(&self.config).scan().await {
            Ok(files) => files,
            Err(e) => return Err(self.abort(e, Some(&log))),
        };
        self.tracker.set_total(files.len());

        if files.is_empty() {
            log.info("No images to compress found");
            self.tracker.transition(RunPhase::Done)?;
            self.progress.nothing_to_do();
            return Ok(self.finish(&log, started, None, None));
        }

        self.tracker.transition(RunPhase::Running)?;
        self.dispatch_all(&files, &log).await;

        let next = if self.config.upload { RunPhase::Uploading } else { RunPhase::Done };
        let phase = self.tracker.settle(&self.cancel, next)?;
        let snapshot = self.tracker.snapshot();
        let mut upload = None;
        let mut upload_error = None;

        if phase == RunPhase::Canceled {
            if !snapshot.canceled {
                // Canceled after the last dispatch; nothing was skipped.
                self.progress.status(CANCELED_MESSAGE, false);
            }
            self.tracker.mark_canceled();
            log.warn(format!(
                "Run canceled after dispatching {}/{} files",
                snapshot.dispatched, snapshot.total_discovered
            ));
        } else {
            self.progress.status(completion_line(&snapshot, &source_dir), true);

            if phase == RunPhase::Uploading {
                let request = UploadRequest {
                    compressed_dir: self.config.compressed_dir(),
                    server_address: self.config.server_address.clone(),
                    api_key: self.config.api_key.clone(),
                };

                let handoff = UploadHandoff::new(self.uploader.clone(), log.clone());
                match handoff.run(&request, &self.progress).await {
                    Ok(result) => {
                        upload = Some(result);
                        self.tracker.transition(RunPhase::Done)?;
                    }
                    Err(e) => {
                        if let crate::error::UploadError::UploadExit(result) = &e {
                            upload = Some(result.clone());
                        }
                        upload_error = Some(e.to_string());
                        self.tracker.transition(RunPhase::Failed)?;
                    }
                }
            }
        }

        self.progress.done();
        Ok(self.finish(&log, started, upload, upload_error))
    }

    /// Create `<source>/compressed` and open the run log inside it. The
    /// source directory must already exist.
    async fn prepare(&self, source_dir: &Path) -> Result<RunLog, RunError> {
        let metadata = fs::metadata(source_dir).await.map_err(|source| RunError::Discovery {
            path: source_dir.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(RunError::Discovery {
                path: source_dir.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            });
        }

        let output_dir = self.config.compressed_dir();
        fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| RunError::OutputDir {
                path: output_dir.clone(),
                source,
            })?;

        RunLog::open(&output_dir).map_err(RunError::RunLog)
    }

    /// Feed jobs to the pool in discovery order until the list is exhausted
    /// or cancellation is observed, then drain the pool.
    async fn dispatch_all(&self, files: &[DiscoveredFile], log: &RunLog) {
        let total = files.len();
        let workers = self.config.worker_count().min(total).max(1);
        let (work_tx, work_rx) = async_channel::bounded(workers * 2);

        let context = Arc::new(WorkerContext {
            transcoder: self.transcoder.clone(),
            progress: self.progress.clone(),
            tracker: self.tracker.clone(),
            log: log.clone(),
            max_retries: self.config.max_retries,
            backoff: self.config.backoff(),
        });

        info!("Starting {} workers for {} files", workers, total);
        let handles: Vec<_> = (0..workers)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, work_rx.clone(), context.clone())))
            .collect();
        // Only workers hold the receiving side, so sends fail if they all die.
        drop(work_rx);

        let output_dir = self.config.compressed_dir();
        for file in files {
            if self.cancel.is_canceled() {
                self.tracker.mark_canceled();
                self.progress.status(CANCELED_MESSAGE, false);
                break;
            }

            let job = CompressionJob {
                source_path: file.path.clone(),
                output_dir: output_dir.clone(),
                output_format: self.config.output_format,
                jpeg_quality: self.config.jpeg_quality,
                png_compression_level: self.config.png_compression,
            };
            if work_tx.send(WorkItem::Job(job)).await.is_err() {
                warn!("All workers exited, stopping dispatch");
                break;
            }

            let dispatched = self.tracker.record_dispatch();
            self.progress.status(format!("Queued files - {}/{}", dispatched, total), true);
        }

        for _ in 0..workers {
            let _ = work_tx.send(WorkItem::Shutdown).await;
        }
        for (worker_id, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = result {
                warn!("Worker {} ended abnormally: {}", worker_id, e);
            }
        }
        debug!("Worker pool drained");
    }

    /// Report a setup failure and terminate the run.
    fn abort(&self, error: RunError, log: Option<&RunLog>) -> RunError {
        let message = error.to_string();
        match log {
            Some(log) => {
                log.error(message.clone());
                let _ = log.close();
            }
            None => warn!("{}", message),
        }
        if let Err(e) = self.tracker.transition(RunPhase::Failed) {
            debug!("{}", e);
        }
        self.progress.status(message, false);
        self.progress.done();
        error
    }

    fn finish(
        &self,
        log: &RunLog,
        started: Instant,
        upload: Option<UploadResult>,
        upload_error: Option<String>,
    ) -> RunSummary {
        let state = self.tracker.snapshot();
        let elapsed = started.elapsed();

        log.info(format!(
            "Run finished as {:?} in {}: {} succeeded, {} failed, {} never started",
            state.phase,
            humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
            state.succeeded,
            state.failed,
            state.total_discovered - state.dispatched
        ));
        if let Err(e) = log.close() {
            warn!("Failed to close run log: {}", e);
        }

        RunSummary {
            run_id: self.run_id,
            phase: state.phase,
            total_discovered: state.total_discovered,
            dispatched: state.dispatched,
            succeeded: state.succeeded,
            failed: state.failed,
            never_started: state.total_discovered - state.dispatched,
            upload,
            upload_error,
            elapsed,
        }
    }
}

fn completion_line(state: &RunState, source_dir: &Path) -> String {
    if state.failed == 0 {
        format!(
            "All files were compressed successfully in the directory: {}",
            source_dir.display()
        )
    } else {
        format!(
            "Compression finished: {} succeeded, {} failed",
            state.succeeded, state.failed
        )
    }
}

async fn worker_loop(worker_id: usize, work: async_channel::Receiver<WorkItem>, context: Arc<WorkerContext>) {
    debug!("Worker {} started", worker_id);

    loop {
        match work.recv().await {
            Ok(WorkItem::Job(job)) => {
                let outcome = RetryableTask::new(job, context.transcoder.clone(), context.log.clone())
                    .with_max_retries(context.max_retries)
                    .with_backoff(context.backoff)
                    .run(&context.progress)
                    .await;
                context.tracker.record_outcome(outcome.success);
            }
            Ok(WorkItem::Shutdown) => {
                debug!("Worker {} shutting down", worker_id);
                break;
            }
            Err(_) => {
                debug!("Worker {} queue closed", worker_id);
                break;
            }
        }
    }
}

/// Cloneable cancel trigger, e.g. for a signal handler task.
#[derive(Debug, Clone)]
pub struct RunCanceler {
    cancel: CancellationFlag,
    progress: ProgressSender,
    tracker: RunTracker,
}

impl RunCanceler {
    /// Request cooperative cancellation. Jobs already dispatched still run.
    /// Ignored once dispatch is over (the upload cannot be interrupted) or
    /// a cancel is already pending.
    pub fn cancel(&self) {
        if self.cancel.is_canceled() {
            return;
        }
        // The phase lock is held across the notice, so `Done` cannot overtake it.
        self.tracker.while_phase(
            |phase| matches!(phase, RunPhase::Idle | RunPhase::Discovering | RunPhase::Running),
            || {
                self.progress.status(CANCELING_MESSAGE, false);
                self.cancel.cancel();
            },
        );
    }
}

/// Handle to a run spawned with [`JobScheduler::spawn`].
pub struct RunHandle {
    canceler: RunCanceler,
    handle: tokio::task::JoinHandle<Result<RunSummary, RunError>>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.canceler.cancel();
    }

    pub fn canceler(&self) -> RunCanceler {
        self.canceler.clone()
    }

    pub fn state(&self) -> RunState {
        self.canceler.tracker.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<RunSummary, RunError> {
        self.handle.await?
    }
}
