//! Post-run handoff of the compressed directory to an external uploader.

pub mod process;

pub use process::ProcessUploader;

use crate::compress::progress::ProgressSender;
use crate::error::UploadError;
use crate::utils::run_log::RunLog;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const UPLOAD_SUCCESS_MESSAGE: &str = "Upload to server completed successfully.";

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub compressed_dir: PathBuf,
    pub server_address: String,
    pub api_key: String,
}

/// Captured result of one uploader run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadResult {
    /// Process exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl UploadResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the upload step. A non-zero exit is a normal `Ok` result; errors
/// are reserved for not being able to run the uploader at all.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResult, UploadError>;
}

/// Validates credentials, runs the uploader and relays the outcome through
/// the progress channel. Every path produces exactly one progress message
/// and one log line describing the result.
pub struct UploadHandoff {
    uploader: Arc<dyn Uploader>,
    log: RunLog,
}

impl UploadHandoff {
    pub fn new(uploader: Arc<dyn Uploader>, log: RunLog) -> Self {
        Self { uploader, log }
    }

    pub async fn run(&self, request: &UploadRequest, progress: &ProgressSender) -> Result<UploadResult, UploadError> {
        if request.server_address.trim().is_empty() || request.api_key.trim().is_empty() {
            return Err(self.fail(UploadError::Credential, progress));
        }

        self.log.info(format!(
            "Starting upload of {} to {}",
            request.compressed_dir.display(),
            request.server_address
        ));

        match self.uploader.upload(request).await {
            Ok(result) if result.success() => {
                self.log.info(UPLOAD_SUCCESS_MESSAGE);
                let stdout = result.stdout.trim_end();
                let message = if stdout.is_empty() { UPLOAD_SUCCESS_MESSAGE } else { stdout };
                progress.status(message, true);
                Ok(result)
            }
            Ok(result) => Err(self.fail(UploadError::UploadExit(result), progress)),
            Err(e) => Err(self.fail(e, progress)),
        }
    }

    fn fail(&self, error: UploadError, progress: &ProgressSender) -> UploadError {
        let message = error.to_string();
        self.log.error(message.clone());
        progress.status(message, false);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::progress::{ProgressChannel, ProgressMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a canned result and counts invocations.
    struct ScriptedUploader {
        result: Result<UploadResult, fn() -> UploadError>,
        calls: AtomicUsize,
    }

    impl ScriptedUploader {
        fn exiting(exit_code: i32, stdout: &str, stderr: &str) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(UploadResult {
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                }),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(error: fn() -> UploadError) -> Arc<Self> {
            Arc::new(Self {
                result: Err(error),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Uploader for ScriptedUploader {
        async fn upload(&self, _request: &UploadRequest) -> Result<UploadResult, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(result) => Ok(result.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn request(server: &str, key: &str) -> UploadRequest {
        UploadRequest {
            compressed_dir: PathBuf::from("/photos/compressed"),
            server_address: server.to_string(),
            api_key: key.to_string(),
        }
    }

    fn statuses(messages: Vec<ProgressMessage>) -> Vec<(String, bool)> {
        messages
            .into_iter()
            .filter_map(|m| match m {
                ProgressMessage::Status { message, success } => Some((message, success)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_missing_credentials_never_invoke_uploader() {
        for (server, key) in [("", "key"), ("https://photos.example.com", ""), ("  ", " ")] {
            let uploader = ScriptedUploader::exiting(0, "ok", "");
            let (tx, rx) = ProgressChannel::open();
            let handoff = UploadHandoff::new(uploader.clone(), RunLog::in_memory(10));

            let err = handoff.run(&request(server, key), &tx).await.unwrap_err();
            assert!(matches!(err, UploadError::Credential));
            assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);

            let statuses = statuses(rx.drain());
            assert_eq!(statuses.len(), 1);
            assert!(!statuses[0].1);
        }
    }

    #[tokio::test]
    async fn test_exit_zero_relays_stdout() {
        let uploader = ScriptedUploader::exiting(0, "ok", "");
        let log = RunLog::in_memory(10);
        let (tx, rx) = ProgressChannel::open();

        let result = UploadHandoff::new(uploader, log.clone())
            .run(&request("https://photos.example.com", "key"), &tx)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(statuses(rx.drain()), vec![("ok".to_string(), true)]);
        assert!(log.entries(None).iter().any(|e| e.message == UPLOAD_SUCCESS_MESSAGE));
    }

    #[tokio::test]
    async fn test_exit_zero_with_empty_stdout_uses_default_message() {
        let uploader = ScriptedUploader::exiting(0, "\n", "");
        let (tx, rx) = ProgressChannel::open();

        UploadHandoff::new(uploader, RunLog::in_memory(10))
            .run(&request("https://photos.example.com", "key"), &tx)
            .await
            .unwrap();

        assert_eq!(statuses(rx.drain()), vec![(UPLOAD_SUCCESS_MESSAGE.to_string(), true)]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_relays_stderr() {
        let uploader = ScriptedUploader::exiting(1, "partial", "bad");
        let (tx, rx) = ProgressChannel::open();

        let err = UploadHandoff::new(uploader, RunLog::in_memory(10))
            .run(&request("https://photos.example.com", "key"), &tx)
            .await
            .unwrap_err();

        match &err {
            UploadError::UploadExit(result) => assert_eq!(result.exit_code, 1),
            other => panic!("unexpected error: {other:?}"),
        }
        let statuses = statuses(rx.drain());
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].0.contains("bad"));
        assert!(!statuses[0].1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_distinct_from_exit() {
        let uploader = ScriptedUploader::failing(|| UploadError::ProcessLaunch {
            program: "run_immich.sh".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        });
        let log = RunLog::in_memory(10);
        let (tx, rx) = ProgressChannel::open();

        let err = UploadHandoff::new(uploader, log.clone())
            .run(&request("https://photos.example.com", "key"), &tx)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::ProcessLaunch { .. }));
        let statuses = statuses(rx.drain());
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].0.starts_with("Failed to start upload"));
        assert!(log.entries(None).iter().any(|e| e.message.starts_with("Failed to start upload")));
    }
}
