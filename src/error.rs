use std::path::PathBuf;

use crate::compress::state::RunPhase;
use crate::upload::UploadResult;

/// Failure of a single compression attempt. Contained by the retry loop and
/// surfaced only as a failed `TaskOutcome`.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),
    #[error("codec panicked while processing the image")]
    Panicked,
}

impl TaskError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that abort the upload phase only.
#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("Error: Please provide both server address and API key.")]
    Credential,
    #[error("Error: uploader binary not found at {}.", .0.display())]
    BinaryNotFound(PathBuf),
    #[error("Failed to start upload to server: {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to upload to server (exit code {}): {}", .0.exit_code, .0.stderr.trim_end())]
    UploadExit(UploadResult),
}

/// Errors that prevent a run from getting to the worker pool.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("source directory is not usable: {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no source directory provided")]
    EmptySourceDir,
    #[error("failed to create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open run log: {0}")]
    RunLog(#[source] std::io::Error),
    #[error("invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunPhase, to: RunPhase },
    #[error("scheduler has already been started")]
    AlreadyStarted,
    #[error("scheduler task ended abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("JPEG quality must be within 0..=90, got {0}")]
    JpegQuality(u8),
    #[error("PNG compression level must be within 0..=9, got {0}")]
    PngCompression(u8),
    #[error("unknown output format {0:?} (expected JPEG or PNG)")]
    UnknownFormat(String),
    #[error("max retries must be at least 1")]
    ZeroRetries,
    #[error("upload requested but server address or API key is missing")]
    MissingCredentials,
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProgressError {
    #[error("progress channel closed before the run reported completion")]
    Disconnected,
}
