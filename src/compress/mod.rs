pub mod estimate;
pub mod progress;
pub mod scanner;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod transcoder;

pub use estimate::{estimate_dir, SizeEstimate, SizeEstimator};
pub use progress::{ProgressChannel, ProgressConsumer, ProgressMessage, ProgressTally, ReportEvent, ReportSink};
pub use scanner::{DiscoveredFile, ImageScanner};
pub use scheduler::{JobScheduler, RunCanceler, RunHandle, RunSummary};
pub use state::{RunPhase, RunState, RunTracker};
pub use task::{BackoffPolicy, RetryableTask};
pub use transcoder::{ImageTranscoder, Transcoder};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ConfigError;

/// Extensions picked up by discovery, compared case-insensitively.
pub const VALID_IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "cr2", "cr3", "nef", "nrw", "arw", "sr2", "srf",
];

/// Camera RAW extensions; these are normalised to RGB before encoding.
pub const RAW_EXTENSIONS: &[&str] = &["cr2", "cr3", "nef", "nrw", "arw", "sr2", "srf"];

/// Name of the output directory created inside the source directory.
pub const COMPRESSED_DIR_NAME: &str = "compressed";

/// Suffix appended to the input stem to form the output name.
pub const OUTPUT_SUFFIX: &str = "_compressed";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    /// Extension used for output files (`jpeg` or `png`).
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jpeg => f.write_str("JPEG"),
            OutputFormat::Png => f.write_str("PNG"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

/// One file to compress. Built by the scheduler and moved into the worker
/// that executes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionJob {
    pub source_path: PathBuf,
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    pub jpeg_quality: u8,
    pub png_compression_level: u8,
}

impl CompressionJob {
    pub fn source_filename(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source_path.to_string_lossy().to_string())
    }

    pub fn output_path(&self) -> PathBuf {
        output_path_for(&self.source_path, &self.output_dir, self.output_format)
    }

    pub fn is_raw(&self) -> bool {
        has_extension(&self.source_path, RAW_EXTENSIONS)
    }
}

/// `<output_dir>/<stem>_compressed.<ext>`. Inputs sharing a stem map to the
/// same output and overwrite one another.
pub fn output_path_for(source: &Path, output_dir: &Path, format: OutputFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    output_dir.join(format!("{}{}.{}", stem, OUTPUT_SUFFIX, format.extension()))
}

pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .map_or(false, |ext| extensions.iter().any(|e| *e == ext))
}

/// Terminal result of one job, as seen by the progress consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOutcome {
    pub source_filename: String,
    pub success: bool,
    pub message: String,
    /// 1-based number of the attempt that produced this outcome.
    pub attempt: u32,
}

impl TaskOutcome {
    pub fn succeeded(filename: &str, attempt: u32) -> Self {
        Self {
            source_filename: filename.to_string(),
            success: true,
            message: format!("Successfully compressed {}", filename),
            attempt,
        }
    }

    pub fn failed(filename: &str, attempt: u32, error: &dyn fmt::Display) -> Self {
        Self {
            source_filename: filename.to_string(),
            success: false,
            message: format!("Failed to process {}: {}", filename, error),
            attempt,
        }
    }
}

/// Shared cooperative cancellation flag. Checked, never awaited.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
