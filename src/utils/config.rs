use crate::compress::estimate::SizeEstimator;
use crate::compress::task::{BackoffPolicy, DEFAULT_MAX_RETRIES};
use crate::compress::{OutputFormat, COMPRESSED_DIR_NAME};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Hard ceiling on the worker pool regardless of core count.
pub const MAX_POOL_SIZE: usize = 32;

pub const MAX_JPEG_QUALITY: u8 = 90;
pub const MAX_PNG_COMPRESSION: u8 = 9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressorConfig {
    /// Directory holding the images to compress
    pub source_dir: PathBuf,

    /// Format written for every input
    pub output_format: OutputFormat,

    /// JPEG quality (0-90)
    pub jpeg_quality: u8,

    /// PNG compression level (0-9)
    pub png_compression: u8,

    /// Hand the compressed directory to the uploader after a clean run
    pub upload: bool,

    pub server_address: String,

    #[serde(skip_serializing, default)]
    pub api_key: String,

    /// Attempts per file, including the first
    pub max_retries: u32,

    /// Base delay of the exponential backoff between attempts
    #[serde(with = "duration_str")]
    pub backoff_unit: Duration,

    /// Maximum number of workers (0 = auto based on CPU)
    pub max_workers: usize,

    /// Uploader executable; its file name is never treated as an input
    pub uploader_binary: PathBuf,

    /// Launcher script invoked as `launcher <binary> <dir> <server> <key>`
    pub uploader_launcher: PathBuf,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        let base = install_dir();

        Self {
            source_dir: PathBuf::new(),
            output_format: OutputFormat::Jpeg,
            jpeg_quality: 85,
            png_compression: 6,
            upload: false,
            server_address: String::new(),
            api_key: String::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_unit: Duration::from_secs(1),
            max_workers: 0, // Auto-detect
            uploader_binary: base.join(format!("immich-go{}", std::env::consts::EXE_SUFFIX)),
            uploader_launcher: base.join(if cfg!(windows) { "run_immich.bat" } else { "run_immich.sh" }),
        }
    }
}

impl CompressorConfig {
    /// Defaults overridden by `COMPRESSOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = CompressorConfig::default();

        if let Some(dir) = lookup("COMPRESSOR_SOURCE_DIR") {
            config.source_dir = PathBuf::from(dir);
        }
        if let Some(format) = lookup("COMPRESSOR_OUTPUT_FORMAT") {
            config.output_format = OutputFormat::from_str(&format)?;
        }
        if let Some(quality) = lookup("COMPRESSOR_JPEG_QUALITY") {
            config.jpeg_quality = parse("COMPRESSOR_JPEG_QUALITY", &quality)?;
        }
        if let Some(level) = lookup("COMPRESSOR_PNG_COMPRESSION") {
            config.png_compression = parse("COMPRESSOR_PNG_COMPRESSION", &level)?;
        }
        if let Some(upload) = lookup("COMPRESSOR_UPLOAD") {
            config.upload = parse("COMPRESSOR_UPLOAD", &upload)?;
        }
        if let Some(server) = lookup("COMPRESSOR_SERVER_ADDRESS") {
            config.server_address = server;
        }
        if let Some(key) = lookup("COMPRESSOR_API_KEY") {
            config.api_key = key;
        }
        if let Some(retries) = lookup("COMPRESSOR_MAX_RETRIES") {
            config.max_retries = parse("COMPRESSOR_MAX_RETRIES", &retries)?;
        }
        if let Some(unit) = lookup("COMPRESSOR_BACKOFF_UNIT") {
            config.backoff_unit = humantime::parse_duration(&unit).map_err(|_| ConfigError::InvalidEnv {
                key: "COMPRESSOR_BACKOFF_UNIT",
                value: unit.clone(),
            })?;
        }
        if let Some(workers) = lookup("COMPRESSOR_MAX_WORKERS") {
            config.max_workers = parse("COMPRESSOR_MAX_WORKERS", &workers)?;
        }
        if let Some(binary) = lookup("COMPRESSOR_UPLOADER_BINARY") {
            config.uploader_binary = PathBuf::from(binary);
        }
        if let Some(launcher) = lookup("COMPRESSOR_UPLOADER_LAUNCHER") {
            config.uploader_launcher = PathBuf::from(launcher);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_levels()?;
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        if self.upload && (self.server_address.is_empty() || self.api_key.is_empty()) {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(())
    }

    /// Range checks for the encoder settings alone.
    pub fn validate_levels(&self) -> Result<(), ConfigError> {
        if self.jpeg_quality > MAX_JPEG_QUALITY {
            return Err(ConfigError::JpegQuality(self.jpeg_quality));
        }
        if self.png_compression > MAX_PNG_COMPRESSION {
            return Err(ConfigError::PngCompression(self.png_compression));
        }
        Ok(())
    }

    /// Estimator for the configured encoder settings. Upload settings are
    /// not checked since estimation never uploads.
    pub fn estimator(&self) -> Result<SizeEstimator, ConfigError> {
        self.validate_levels()?;
        Ok(SizeEstimator::new(self.jpeg_quality, self.png_compression))
    }

    /// `min(cores, 32)`, or the configured cap when smaller.
    pub fn worker_count(&self) -> usize {
        let auto = num_cpus::get().clamp(1, MAX_POOL_SIZE);
        match self.max_workers {
            0 => auto,
            n => n.min(MAX_POOL_SIZE),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_unit)
    }

    pub fn compressed_dir(&self) -> PathBuf {
        compressed_dir_for(&self.source_dir)
    }
}

pub fn compressed_dir_for(source_dir: &Path) -> PathBuf {
    source_dir.join(COMPRESSED_DIR_NAME)
}

fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

/// Serialize durations as humantime strings ("1s", "250ms").
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CompressorConfig::default();
        assert_eq!(config.output_format, OutputFormat::Jpeg);
        assert_eq!(config.jpeg_quality, 85);
        assert_eq!(config.png_compression, 6);
        assert_eq!(config.max_retries, 3);
        assert!(!config.upload);
        assert!(config.validate().is_ok());
        assert!(config
            .uploader_binary
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("immich-go"));
    }

    #[test]
    fn test_estimator_rejects_out_of_range_levels() {
        let mut config = CompressorConfig {
            jpeg_quality: 200,
            ..CompressorConfig::default()
        };
        assert!(matches!(config.estimator(), Err(ConfigError::JpegQuality(200))));

        config.jpeg_quality = MAX_JPEG_QUALITY;
        config.png_compression = 12;
        assert!(matches!(config.estimator(), Err(ConfigError::PngCompression(12))));

        // Missing upload credentials do not matter for an estimate.
        config.png_compression = MAX_PNG_COMPRESSION;
        config.upload = true;
        assert!(config.validate().is_err());
        assert_eq!(
            config.estimator().unwrap(),
            SizeEstimator::new(MAX_JPEG_QUALITY, MAX_PNG_COMPRESSION)
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = CompressorConfig::from_lookup(lookup(&[
            ("COMPRESSOR_SOURCE_DIR", "/photos"),
            ("COMPRESSOR_OUTPUT_FORMAT", "png"),
            ("COMPRESSOR_PNG_COMPRESSION", "9"),
            ("COMPRESSOR_UPLOAD", "true"),
            ("COMPRESSOR_SERVER_ADDRESS", "https://photos.example.com"),
            ("COMPRESSOR_API_KEY", "secret"),
            ("COMPRESSOR_BACKOFF_UNIT", "250ms"),
            ("COMPRESSOR_MAX_WORKERS", "4"),
        ]))
        .unwrap();

        assert_eq!(config.source_dir, PathBuf::from("/photos"));
        assert_eq!(config.compressed_dir(), PathBuf::from("/photos/compressed"));
        assert_eq!(config.output_format, OutputFormat::Png);
        assert_eq!(config.png_compression, 9);
        assert!(config.upload);
        assert_eq!(config.backoff_unit, Duration::from_millis(250));
        assert_eq!(config.worker_count(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparsable_env_is_an_error() {
        let err = CompressorConfig::from_lookup(lookup(&[("COMPRESSOR_JPEG_QUALITY", "high")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "COMPRESSOR_JPEG_QUALITY", .. }));

        let err = CompressorConfig::from_lookup(lookup(&[("COMPRESSOR_OUTPUT_FORMAT", "gif")])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFormat(_)));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = CompressorConfig::default();
        config.jpeg_quality = 91;
        assert!(matches!(config.validate(), Err(ConfigError::JpegQuality(91))));

        let mut config = CompressorConfig::default();
        config.png_compression = 10;
        assert!(matches!(config.validate(), Err(ConfigError::PngCompression(10))));

        let mut config = CompressorConfig::default();
        config.max_retries = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroRetries)));
    }

    #[test]
    fn test_upload_requires_credentials() {
        let mut config = CompressorConfig::default();
        config.upload = true;
        config.server_address = "https://photos.example.com".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingCredentials)));

        config.api_key = "key".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_count_is_capped() {
        let mut config = CompressorConfig::default();
        assert!((1..=MAX_POOL_SIZE).contains(&config.worker_count()));
        config.max_workers = 500;
        assert_eq!(config.worker_count(), MAX_POOL_SIZE);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let mut config = CompressorConfig::default();
        config.api_key = "super-secret".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(json.contains("\"backoff_unit\":\"1s\""));
    }
}
