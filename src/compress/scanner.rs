use super::{has_extension, VALID_IMAGE_EXTENSIONS};
use crate::error::RunError;
use crate::utils::config::CompressorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// Non-recursive discovery of candidate images in the source directory.
pub struct ImageScanner {
    source_dir: PathBuf,
    /// Lowercased file name of the uploader binary, never treated as input.
    excluded_name: Option<String>,
}

impl ImageScanner {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            excluded_name: None,
        }
    }

    pub fn from_config(config: &CompressorConfig) -> Self {
        let excluded = config
            .uploader_binary
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        let mut scanner = Self::new(&config.source_dir);
        if let Some(name) = excluded {
            scanner = scanner.excluding(name);
        }
        scanner
    }

    pub fn excluding(mut self, file_name: impl AsRef<str>) -> Self {
        self.excluded_name = Some(file_name.as_ref().to_lowercase());
        self
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Recognised images, largest first. Equal sizes fall back to name order
    /// so repeated scans dispatch identically.
    pub async fn scan(&self) -> Result<Vec<DiscoveredFile>, RunError> {
        let discovery_error = |source| RunError::Discovery {
            path: self.source_dir.clone(),
            source,
        };

        info!("Scanning images in {}", self.source_dir.display());
        let mut entries = fs::read_dir(&self.source_dir).await.map_err(discovery_error)?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(discovery_error)? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if !self.is_candidate(&path, &name) {
                continue;
            }

            let metadata = match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };

            files.push(DiscoveredFile {
                path,
                name,
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
        info!("Found {} image files", files.len());

        Ok(files)
    }

    pub async fn count(&self) -> Result<usize, RunError> {
        Ok(self.scan().await?.len())
    }

    fn is_candidate(&self, path: &Path, name: &str) -> bool {
        if let Some(excluded) = &self.excluded_name {
            if name.to_lowercase() == *excluded {
                debug!("Skipping uploader binary: {}", name);
                return false;
            }
        }
        has_extension(path, VALID_IMAGE_EXTENSIONS)
    }
}
