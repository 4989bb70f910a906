//! Decodability check: turns upload bytes into a raster image or rejects them.

use image::{DynamicImage, GenericImageView, ImageReader, Limits};
use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::config::PipelineConfig;
use crate::error::FailureReason;
use crate::upload::{MediaType, RawUpload};

/// A decoded raster image with positive width and height.
///
/// Owned by a single pipeline run and never mutated after decode.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    image: DynamicImage,
    media_type: MediaType,
}

impl DecodedImage {
    /// Wrap an already-decoded image. Returns `None` for zero-sized images.
    pub fn new(image: DynamicImage, media_type: MediaType) -> Option<Self> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { image, media_type })
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Container format the pixels were decoded from
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }
}

fn decode_limits(config: &PipelineConfig) -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_image_dimension);
    limits.max_image_height = Some(config.max_image_dimension);
    limits.max_alloc = Some(config.max_decode_alloc_bytes);
    limits
}

/// Decode the upload as `declared`.
///
/// The container is sniffed from its magic bytes first; a sniffed format that
/// disagrees with the declared type is treated as corrupt. When sniffing fails the
/// declared format is used and the decoder decides.
pub fn decode(
    upload: &RawUpload,
    declared: MediaType,
    config: &PipelineConfig,
) -> Result<DecodedImage, FailureReason> {
    let bytes = upload.bytes();

    if let Ok(sniffed) = image::guess_format(bytes) {
        if MediaType::from_image_format(sniffed) != Some(declared) {
            log::debug!(
                "Declared {} but bytes look like {:?}",
                declared.mime(),
                sniffed
            );
            return Err(FailureReason::CorruptOrUndecodable);
        }
    }

    let mut reader = ImageReader::with_format(Cursor::new(bytes), declared.image_format());
    reader.limits(decode_limits(config));

    let decoded = catch_unwind(AssertUnwindSafe(|| reader.decode())).map_err(|_| {
        log::warn!("Decoder panicked on {} upload", declared.mime());
        FailureReason::CorruptOrUndecodable
    })?;

    let image = decoded.map_err(|e| {
        log::debug!("Failed to decode {} upload: {}", declared.mime(), e);
        FailureReason::CorruptOrUndecodable
    })?;

    DecodedImage::new(image, declared).ok_or_else(|| {
        log::debug!("Decoded image has a zero dimension");
        FailureReason::CorruptOrUndecodable
    })
}
