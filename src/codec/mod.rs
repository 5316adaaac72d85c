//! Image decoding, geometry and re-encoding
//!
//! The pipeline talks to an [`ImageTransformer`]; [`RasterTransformer`] is the
//! `image`-crate implementation used in production.

pub mod dimensions;

pub use dimensions::resize_dimensions;

use std::io::Cursor;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageOutputFormat};
use tracing::trace;

use crate::config::{CodecConfig, DEFAULT_JPEG_QUALITY, DEFAULT_MAX_OUTPUT_PIXELS};
use crate::errors::{LoaderError, LoaderResult};
use crate::models::TransformOptions;

/// Encodings produced by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
    Png,
    Jpeg,
}

impl ImageMime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// Recognise an encoded payload by its magic bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else {
            None
        }
    }
}

/// Output of a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime: ImageMime,
    pub data: Vec<u8>,
}

impl EncodedImage {
    /// Wrap an already encoded payload, e.g. one read back from the cache.
    /// Unknown payloads are labelled PNG.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mime = ImageMime::sniff(&data).unwrap_or(ImageMime::Png);
        Self { mime, data }
    }

    /// `data:<mime>;base64,<payload>`
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime.as_str(), STANDARD.encode(&self.data))
    }
}

/// Turns source bytes into an encoded, resized and rotated image.
pub trait ImageTransformer: Send + Sync {
    fn transform(&self, source: &[u8], options: &TransformOptions) -> LoaderResult<EncodedImage>;
}

/// Decode with `image`, rotate, resize, then keep the smaller of PNG and JPEG
/// with a strong bias towards lossless.
#[derive(Debug, Clone)]
pub struct RasterTransformer {
    jpeg_quality: u8,
    max_output_pixels: u64,
}

impl RasterTransformer {
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            max_output_pixels: config.max_output_pixels.max(1),
        }
    }

    fn render(
        &self,
        image: DynamicImage,
        options: &TransformOptions,
    ) -> LoaderResult<DynamicImage> {
        let (width, height) = resize_dimensions(image.width(), image.height(), options);
        // An empty canvas cannot be encoded; keep at least one pixel.
        let (width, height) = (width.max(1), height.max(1));

        let pixels = u64::from(width) * u64::from(height);
        if pixels > self.max_output_pixels {
            return Err(LoaderError::decode(format!(
                "output of {}x{} exceeds the limit of {} pixels",
                width, height, self.max_output_pixels
            )));
        }

        let rotated = match options.quarter_turns() {
            1 => image.rotate90(),
            2 => image.rotate180(),
            3 => image.rotate270(),
            _ => image,
        };

        if rotated.width() == width && rotated.height() == height {
            Ok(rotated)
        } else {
            Ok(rotated.resize_exact(width, height, FilterType::Triangle))
        }
    }

    fn encode_png(image: &DynamicImage) -> LoaderResult<Vec<u8>> {
        let mut data = Vec::new();
        image.write_to(&mut Cursor::new(&mut data), ImageOutputFormat::Png)?;
        Ok(data)
    }

    fn encode_jpeg(&self, image: &DynamicImage) -> LoaderResult<Vec<u8>> {
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
        let mut data = Vec::new();
        rgb.write_to(
            &mut Cursor::new(&mut data),
            ImageOutputFormat::Jpeg(self.jpeg_quality),
        )?;
        Ok(data)
    }
}

impl Default for RasterTransformer {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_output_pixels: DEFAULT_MAX_OUTPUT_PIXELS,
        }
    }
}

impl ImageTransformer for RasterTransformer {
    fn transform(&self, source: &[u8], options: &TransformOptions) -> LoaderResult<EncodedImage> {
        let decoded = image::load_from_memory(source)?;
        let rendered = self.render(decoded, options)?;

        let png = Self::encode_png(&rendered)?;
        let jpeg = self.encode_jpeg(&rendered)?;
        trace!(
            width = rendered.width(),
            height = rendered.height(),
            png_bytes = png.len(),
            jpeg_bytes = jpeg.len(),
            "Encoded image candidates"
        );

        Ok(choose_encoding(png, jpeg))
    }
}

/// PNG unless JPEG is at most half its size.
pub fn choose_encoding(png: Vec<u8>, jpeg: Vec<u8>) -> EncodedImage {
    if png.len() < jpeg.len() * 2 {
        EncodedImage {
            mime: ImageMime::Png,
            data: png,
        }
    } else {
        EncodedImage {
            mime: ImageMime::Jpeg,
            data: jpeg,
        }
    }
}

/// Run `transformer` on the blocking pool.
pub async fn transform_blocking(
    transformer: Arc<dyn ImageTransformer>,
    source: Vec<u8>,
    options: TransformOptions,
) -> LoaderResult<EncodedImage> {
    tokio::task::spawn_blocking(move || transformer.transform(&source, &options))
        .await
        .map_err(|e| LoaderError::decode(format!("transform task failed: {}", e)))?
}
