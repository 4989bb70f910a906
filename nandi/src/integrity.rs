//! Byte-level upload checks that run before any decoding is attempted.

use crate::config::PipelineConfig;
use crate::error::FailureReason;
use crate::upload::{MediaType, RawUpload};

/// Validate size and declared media type. Never looks at pixel data.
///
/// Returns the media type the decoder should expect.
pub fn check(upload: &RawUpload, config: &PipelineConfig) -> Result<MediaType, FailureReason> {
    if upload.byte_length() > config.max_upload_bytes {
        log::debug!(
            "Upload of {} bytes exceeds ceiling of {} bytes",
            upload.byte_length(),
            config.max_upload_bytes
        );
        return Err(FailureReason::Oversize);
    }

    if !config.allows_media_type(upload.media_type()) {
        log::debug!("Declared media type '{}' is not allowed", upload.media_type());
        return Err(FailureReason::UnsupportedType);
    }

    // Allow-list entries are validated to parse, so this only fails for unvalidated configs
    MediaType::from_mime(upload.media_type()).ok_or(FailureReason::UnsupportedType)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_size_ceiling_boundary() {
        let config = PipelineConfig::default();

        let at_limit = RawUpload::new(vec![0u8; 10 * MIB], "image/png");
        assert_eq!(check(&at_limit, &config), Ok(MediaType::Png));

        let over_limit = RawUpload::new(vec![0u8; 10 * MIB + 1], "image/png");
        assert_eq!(check(&over_limit, &config), Err(FailureReason::Oversize));
    }

    #[test]
    fn test_size_checked_before_type() {
        let config = PipelineConfig::default();
        let upload = RawUpload::new(vec![0u8; 11 * MIB], "application/pdf");
        assert_eq!(check(&upload, &config), Err(FailureReason::Oversize));
    }

    #[test]
    fn test_allow_list() {
        let config = PipelineConfig::default();
        for (mime, expected) in [
            ("image/jpeg", MediaType::Jpeg),
            ("image/jpg", MediaType::Jpeg),
            ("image/png", MediaType::Png),
            ("image/webp", MediaType::Webp),
            ("Image/WEBP", MediaType::Webp),
        ] {
            let upload = RawUpload::new(vec![1, 2, 3], mime);
            assert_eq!(check(&upload, &config), Ok(expected), "{mime}");
        }

        for mime in ["image/gif", "image/bmp", "text/plain", "", "image/png;q=1"] {
            let upload = RawUpload::new(vec![1, 2, 3], mime);
            assert_eq!(
                check(&upload, &config),
                Err(FailureReason::UnsupportedType),
                "{mime}"
            );
        }
    }

    #[test]
    fn test_widened_allow_list() {
        let config = PipelineConfig {
            allowed_media_types: vec!["image/bmp".to_string()],
            ..Default::default()
        };
        let upload = RawUpload::new(vec![1], "image/bmp");
        assert_eq!(check(&upload, &config), Ok(MediaType::Bmp));

        let upload = RawUpload::new(vec![1], "image/png");
        assert_eq!(check(&upload, &config), Err(FailureReason::UnsupportedType));
    }

    #[test]
    fn test_empty_upload_passes_integrity() {
        let config = PipelineConfig::default();
        let upload = RawUpload::new(Vec::new(), "image/jpeg");
        assert_eq!(check(&upload, &config), Ok(MediaType::Jpeg));
    }
}
