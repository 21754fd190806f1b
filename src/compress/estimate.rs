//! Pre-flight output size estimate. Pure over `(name, size)` pairs; the only
//! I/O is the metadata read done by [`estimate_dir`].

use super::scanner::{DiscoveredFile, ImageScanner};
use crate::error::RunError;
use serde::Serialize;
use std::fmt;
use std::path::Path;

const MB: f64 = 1024.0 * 1024.0;
const KB: f64 = 1024.0;

/// Size reduction per PNG compression level.
const PNG_FACTOR_PER_LEVEL: f64 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeEstimator {
    pub jpeg_quality: u8,
    pub png_compression_level: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SizeEstimate {
    pub file_count: usize,
    pub total_original: u64,
    pub average_original: f64,
    pub total_estimated: f64,
    pub average_estimated: f64,
}

impl SizeEstimator {
    pub fn new(jpeg_quality: u8, png_compression_level: u8) -> Self {
        Self {
            jpeg_quality,
            png_compression_level,
        }
    }

    /// Estimated size of one file, keyed off its own extension.
    pub fn estimate_file(&self, name: &str, original_size: u64) -> f64 {
        let size = original_size as f64;
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            size * (f64::from(self.jpeg_quality) / 100.0)
        } else if lower.ends_with(".png") {
            size * (1.0 - PNG_FACTOR_PER_LEVEL * f64::from(self.png_compression_level))
        } else {
            size
        }
    }

    pub fn estimate<'a, I>(&self, files: I) -> SizeEstimate
    where
        I: IntoIterator<Item = (&'a str, u64)>,
    {
        let mut estimate = SizeEstimate::default();
        for (name, size) in files {
            estimate.file_count += 1;
            estimate.total_original += size;
            estimate.total_estimated += self.estimate_file(name, size);
        }
        if estimate.file_count > 0 {
            let count = estimate.file_count as f64;
            estimate.average_original = estimate.total_original as f64 / count;
            estimate.average_estimated = estimate.total_estimated / count;
        }
        estimate
    }

    pub fn estimate_discovered(&self, files: &[DiscoveredFile]) -> SizeEstimate {
        self.estimate(files.iter().map(|f| (f.name.as_str(), f.size)))
    }
}

/// Discover images in `dir` and estimate their compressed size.
pub async fn estimate_dir(scanner: &ImageScanner, estimator: &SizeEstimator) -> Result<SizeEstimate, RunError> {
    let files = scanner.scan().await?;
    Ok(estimator.estimate_discovered(&files))
}

/// Convenience wrapper when no uploader exclusion is needed.
pub async fn estimate_path(dir: &Path, estimator: &SizeEstimator) -> Result<SizeEstimate, RunError> {
    estimate_dir(&ImageScanner::new(dir), estimator).await
}

impl fmt::Display for SizeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total Original size: {:.2} MB", self.total_original as f64 / MB)?;
        writeln!(f, "Original Average file size: {:.2} KB", self.average_original / KB)?;
        writeln!(f)?;
        writeln!(f, "Estimated size after compression: {:.2} MB", self.total_estimated / MB)?;
        write!(f, "Average compressed file size: {:.2} KB", self.average_estimated / KB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_empty_set_is_all_zero() {
        let estimate = SizeEstimator::new(85, 6).estimate(Vec::<(&str, u64)>::new());
        assert_eq!(estimate, SizeEstimate::default());
        assert_eq!(estimate.average_original, 0.0);
        assert_eq!(estimate.average_estimated, 0.0);
    }

    #[test]
    fn test_jpeg_uses_quality() {
        let estimator = SizeEstimator::new(85, 6);
        assert!(close(estimator.estimate_file("a.jpg", 1000), 850.0));
        assert!(close(estimator.estimate_file("b.JPEG", 1000), 850.0));
    }

    #[test]
    fn test_png_uses_level() {
        let estimator = SizeEstimator::new(85, 6);
        assert!(close(estimator.estimate_file("a.png", 1000), 820.0));
        assert!(close(SizeEstimator::new(85, 0).estimate_file("a.PNG", 1000), 1000.0));
    }

    #[test]
    fn test_raw_passes_through() {
        let estimator = SizeEstimator::new(10, 9);
        assert!(close(estimator.estimate_file("a.cr2", 1000), 1000.0));
        assert!(close(estimator.estimate_file("b.nef", 42), 42.0));
    }

    #[test]
    fn test_aggregates() {
        let estimate = SizeEstimator::new(50, 0).estimate(vec![("a.jpg", 1000), ("b.png", 3000)]);
        assert_eq!(estimate.file_count, 2);
        assert_eq!(estimate.total_original, 4000);
        assert!(close(estimate.average_original, 2000.0));
        assert!(close(estimate.total_estimated, 3500.0));
        assert!(close(estimate.average_estimated, 1750.0));
    }

    #[test]
    fn test_report_rendering() {
        let estimate = SizeEstimator::new(85, 6).estimate(vec![("a.jpg", 2 * 1024 * 1024)]);
        let text = estimate.to_string();
        assert!(text.starts_with("Total Original size: 2.00 MB\n"));
        assert!(text.contains("Original Average file size: 2048.00 KB"));
        assert!(text.contains("Estimated size after compression: 1.70 MB"));
    }

    #[tokio::test]
    async fn test_estimate_path_reads_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), vec![0u8; 1000]).unwrap();
        std::fs::write(dir.path().join("b.png"), vec![0u8; 1000]).unwrap();
        std::fs::write(dir.path().join("readme.md"), vec![0u8; 1000]).unwrap();

        let estimate = estimate_path(dir.path(), &SizeEstimator::new(85, 6)).await.unwrap();
        assert_eq!(estimate.file_count, 2);
        assert_eq!(estimate.total_original, 2000);
        assert!(close(estimate.total_estimated, 1670.0));
    }

    proptest! {
        #[test]
        fn prop_estimate_never_exceeds_original(
            sizes in proptest::collection::vec(0u64..1_000_000_000, 0..50),
            quality in 0u8..=90,
            level in 0u8..=9,
        ) {
            let names = ["a.jpg", "b.png", "c.cr2", "d.jpeg"];
            let files: Vec<(&str, u64)> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| (names[i % names.len()], *s))
                .collect();
            let estimate = SizeEstimator::new(quality, level).estimate(files.clone());

            prop_assert_eq!(estimate.file_count, files.len());
            prop_assert_eq!(estimate.total_original, sizes.iter().sum::<u64>());
            prop_assert!(estimate.total_estimated <= estimate.total_original as f64 + 1e-3);
            prop_assert!(estimate.average_estimated <= estimate.average_original + 1e-3);
        }
    }
}
