//! Batch image compression with a retrying worker pool, ordered progress
//! reporting and an optional handoff to an external uploader.

pub mod compress;
pub mod error;
pub mod upload;
pub mod utils;

pub use compress::{
    CancellationFlag, CompressionJob, JobScheduler, OutputFormat, ProgressChannel, ProgressConsumer, RunHandle,
    RunPhase, RunSummary, SizeEstimator, TaskOutcome,
};
pub use error::{ConfigError, ProgressError, RunError, TaskError, UploadError};
pub use upload::{ProcessUploader, UploadHandoff, Uploader};
pub use utils::config::CompressorConfig;
