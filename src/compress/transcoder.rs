use super::{CompressionJob, OutputFormat};
use crate::error::TaskError;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::DynamicImage;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::debug;

/// A single compression attempt for one job.
///
/// Runs on the blocking pool, so implementations may do synchronous I/O and
/// CPU-heavy work freely. This seam lets the retry loop be exercised without
/// a real codec.
pub trait Transcoder: Send + Sync {
    /// Produce the compressed output for `job`, returning the written path.
    fn transcode(&self, job: &CompressionJob) -> Result<PathBuf, TaskError>;
}

/// Transcoder backed by the `image` crate.
#[derive(Debug, Default, Clone)]
pub struct ImageTranscoder;

impl ImageTranscoder {
    pub fn new() -> Self {
        Self
    }

    fn decode(&self, job: &CompressionJob) -> Result<DynamicImage, TaskError> {
        let data = std::fs::read(&job.source_path).map_err(|e| TaskError::io(&job.source_path, e))?;
        let format = image::guess_format(&data)
            .map_err(|_| TaskError::UnsupportedFormat(job.source_filename()))?;
        let img = image::load_from_memory_with_format(&data, format).map_err(TaskError::Decode)?;

        // RAW sensor data needs plain RGB, and the JPEG encoder only takes
        // 8-bit images without alpha.
        let jpeg_incompatible = job.output_format == OutputFormat::Jpeg
            && !matches!(img, DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_));
        let needs_rgb = job.is_raw() || jpeg_incompatible;
        if needs_rgb {
            debug!("Normalising {} to RGB", job.source_filename());
            return Ok(DynamicImage::ImageRgb8(img.to_rgb8()));
        }
        Ok(img)
    }

    fn encode<W: Write>(&self, img: &DynamicImage, job: &CompressionJob, writer: W) -> Result<(), TaskError> {
        match job.output_format {
            OutputFormat::Jpeg => {
                // The encoder rejects quality 0.
                let encoder = JpegEncoder::new_with_quality(writer, job.jpeg_quality.max(1));
                img.write_with_encoder(encoder).map_err(TaskError::Encode)
            }
            OutputFormat::Png => {
                let encoder = PngEncoder::new_with_quality(
                    writer,
                    png_compression(job.png_compression_level),
                    FilterType::Adaptive,
                );
                img.write_with_encoder(encoder).map_err(TaskError::Encode)
            }
        }
    }
}

impl Transcoder for ImageTranscoder {
    fn transcode(&self, job: &CompressionJob) -> Result<PathBuf, TaskError> {
        let img = self.decode(job)?;
        let target = job.output_path();

        // Encode into a sibling temp file and rename over the target, so a
        // failed attempt never leaves a truncated output behind.
        let mut tmp = NamedTempFile::new_in(&job.output_dir).map_err(|e| TaskError::io(&job.output_dir, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            self.encode(&img, job, &mut writer)?;
            writer.flush().map_err(|e| TaskError::io(&target, e))?;
        }
        tmp.persist(&target).map_err(|e| TaskError::io(&target, e.error))?;

        Ok(target)
    }
}

/// Map the 0..=9 zlib-style level onto the encoder's presets.
fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}
