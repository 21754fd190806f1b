use super::progress::ProgressSender;
use super::transcoder::Transcoder;
use super::{CompressionJob, TaskOutcome};
use crate::error::TaskError;
use crate::utils::run_log::RunLog;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Exponential backoff: after failed attempt `n` (0-based) wait
/// `unit * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub unit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(unit: Duration) -> Self {
        Self { unit }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor)
    }
}

/// One file's compression, retried up to `max_retries` times.
///
/// Failures never escape: the caller always gets exactly one terminal
/// `TaskOutcome`. Intermediate failures only reach the run log.
pub struct RetryableTask {
    job: Arc<CompressionJob>,
    max_retries: u32,
    backoff: BackoffPolicy,
    transcoder: Arc<dyn Transcoder>,
    log: RunLog,
}

impl RetryableTask {
    pub fn new(job: CompressionJob, transcoder: Arc<dyn Transcoder>, log: RunLog) -> Self {
        Self {
            job: Arc::new(job),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            transcoder,
            log,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Execute and emit the terminal outcome onto the progress channel.
    pub async fn run(self, progress: &ProgressSender) -> TaskOutcome {
        let outcome = self.execute().await;
        progress.outcome(outcome.clone());
        outcome
    }

    pub async fn execute(self) -> TaskOutcome {
        let filename = self.job.source_filename();

        for attempt in 0..self.max_retries {
            self.log.info(format!(
                "Attempt {}: Processing {}",
                attempt + 1,
                self.job.source_path.display()
            ));

            match self.attempt().await {
                Ok(output) => {
                    self.log.info(format!(
                        "Successfully compressed {} -> {}",
                        filename,
                        output.display()
                    ));
                    return TaskOutcome::succeeded(&filename, attempt + 1);
                }
                Err(e) if attempt + 1 >= self.max_retries => {
                    self.log.error(format!("Failed to process {}: {}", filename, e));
                    return TaskOutcome::failed(&filename, attempt + 1, &e);
                }
                Err(e) => {
                    let delay = self.backoff.delay_after(attempt);
                    self.log.warn(format!(
                        "Attempt {} failed for {}: {} (retrying in {})",
                        attempt + 1,
                        filename,
                        e,
                        humantime::format_duration(delay)
                    ));
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_retries is clamped to at least 1, so the loop always returns.
        TaskOutcome::failed(&filename, self.max_retries, &"no attempt was made")
    }

    async fn attempt(&self) -> Result<std::path::PathBuf, TaskError> {
        let transcoder = self.transcoder.clone();
        let job = self.job.clone();
        tokio::task::spawn_blocking(move || transcoder.transcode(&job))
            .await
            .unwrap_or(Err(TaskError::Panicked))
    }
}
