use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Image container formats the pipeline knows how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Jpeg,
    Png,
    Webp,
    Bmp,
    Tiff,
}

impl MediaType {
    /// Parse a MIME type string. Accepts the common `image/jpg` alias.
    /// Parameters such as `;charset=...` are not accepted.
    pub fn from_mime(mime: &str) -> Option<MediaType> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(MediaType::Jpeg),
            "image/png" => Some(MediaType::Png),
            "image/webp" => Some(MediaType::Webp),
            "image/bmp" => Some(MediaType::Bmp),
            "image/tiff" => Some(MediaType::Tiff),
            _ => None,
        }
    }

    /// Guess the media type a file would be uploaded with from its extension
    pub fn from_path(path: &Path) -> Option<MediaType> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(MediaType::Jpeg),
            "png" => Some(MediaType::Png),
            "webp" => Some(MediaType::Webp),
            "bmp" => Some(MediaType::Bmp),
            "tiff" | "tif" => Some(MediaType::Tiff),
            _ => None,
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            MediaType::Jpeg => "image/jpeg",
            MediaType::Png => "image/png",
            MediaType::Webp => "image/webp",
            MediaType::Bmp => "image/bmp",
            MediaType::Tiff => "image/tiff",
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            MediaType::Jpeg => ImageFormat::Jpeg,
            MediaType::Png => ImageFormat::Png,
            MediaType::Webp => ImageFormat::WebP,
            MediaType::Bmp => ImageFormat::Bmp,
            MediaType::Tiff => ImageFormat::Tiff,
        }
    }

    pub fn from_image_format(format: ImageFormat) -> Option<MediaType> {
        match format {
            ImageFormat::Jpeg => Some(MediaType::Jpeg),
            ImageFormat::Png => Some(MediaType::Png),
            ImageFormat::WebP => Some(MediaType::Webp),
            ImageFormat::Bmp => Some(MediaType::Bmp),
            ImageFormat::Tiff => Some(MediaType::Tiff),
            _ => None,
        }
    }
}

/// An image exactly as it arrived at the upload boundary.
///
/// The byte buffer and declared media type are never modified once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUpload {
    bytes: Vec<u8>,
    media_type: String,
}

impl RawUpload {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
        }
    }

    /// Read a file from disk, declaring the media type implied by its extension
    /// unless one is given explicitly.
    ///
    /// At most `max_bytes + 1` bytes are read. A larger file still comes out longer
    /// than `max_bytes`, so the integrity check rejects it without the rest ever
    /// being loaded.
    pub fn from_file(
        path: &Path,
        media_type: Option<&str>,
        max_bytes: u64,
    ) -> anyhow::Result<Self> {
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path.display(), e))?;
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let read_limit = max_bytes.saturating_add(1);
        if file_len > max_bytes {
            log::debug!(
                "{} is {file_len} bytes; reading only the first {read_limit}",
                path.display()
            );
        }

        let mut bytes = Vec::with_capacity(file_len.min(read_limit) as usize);
        file.take(read_limit)
            .read_to_end(&mut bytes)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

        let declared = match media_type {
            Some(mime) => mime.to_string(),
            None => MediaType::from_path(path)
                .map(|m| m.mime().to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        };
        Ok(Self::new(bytes, declared))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The media type as declared by the uploader (not verified)
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn byte_length(&self) -> u64 {
        self.bytes.len() as u64
    }
}
