use super::{UploadRequest, UploadResult, Uploader};
use crate::error::UploadError;
use crate::utils::config::CompressorConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Runs `launcher <binary> <compressed_dir> <server> <api_key>` as a child
/// process. Arguments are passed as-is, never through a shell.
#[derive(Debug, Clone)]
pub struct ProcessUploader {
    binary: PathBuf,
    launcher: PathBuf,
}

impl ProcessUploader {
    pub fn new(binary: impl Into<PathBuf>, launcher: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            launcher: launcher.into(),
        }
    }

    pub fn from_config(config: &CompressorConfig) -> Self {
        Self::new(&config.uploader_binary, &config.uploader_launcher)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Path of the uploader binary, if it is present.
    pub fn locate(&self) -> Result<&Path, UploadError> {
        if self.binary.is_file() {
            Ok(&self.binary)
        } else {
            Err(UploadError::BinaryNotFound(self.binary.clone()))
        }
    }
}

#[async_trait]
impl Uploader for ProcessUploader {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResult, UploadError> {
        let binary = self.locate()?;

        let mut cmd = Command::new(&self.launcher);
        cmd.arg(binary)
            .arg(&request.compressed_dir)
            .arg(&request.server_address)
            .arg(&request.api_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The API key stays out of the logs.
        debug!(
            "Running uploader: {} {} {} {} <api key>",
            self.launcher.display(),
            binary.display(),
            request.compressed_dir.display(),
            request.server_address
        );

        let output = cmd.output().await.map_err(|source| UploadError::ProcessLaunch {
            program: self.launcher.display().to_string(),
            source,
        })?;

        let result = UploadResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        info!("Uploader exited with code {}", result.exit_code);

        Ok(result)
    }
}
