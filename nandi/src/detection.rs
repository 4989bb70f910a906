use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::decode::DecodedImage;
use crate::model_slot::ModelSlot;

/// A single labelled detection produced by a general-purpose object detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Confidence in [0, 1]
    pub score: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

/// "Given an image, return a set of (label, confidence) detections."
///
/// Implementations must be shareable across concurrent pipeline runs.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &DecodedImage) -> Result<Vec<Detection>>;
}

/// A lazily loaded detector: the first call loads the model, concurrent first
/// callers wait on the same load.
impl<D: ObjectDetector> ObjectDetector for ModelSlot<D> {
    fn detect(&self, image: &DecodedImage) -> Result<Vec<Detection>> {
        self.get()?.detect(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::MediaType;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedDetector(Vec<Detection>);

    impl ObjectDetector for FixedDetector {
        fn detect(&self, _image: &DecodedImage) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_lazy_detector_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let slot = ModelSlot::new("detector", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(FixedDetector(vec![Detection::new("cow", 0.9)]))
        });

        let image =
            DecodedImage::new(DynamicImage::new_rgb8(4, 4), MediaType::Png).unwrap();
        for _ in 0..3 {
            let detections = slot.detect(&image).unwrap();
            assert_eq!(detections, vec![Detection::new("cow", 0.9)]);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_detector_surfaces_load_error() {
        let slot: ModelSlot<FixedDetector> =
            ModelSlot::new("detector", || Err(anyhow::anyhow!("model file missing")));
        let image =
            DecodedImage::new(DynamicImage::new_rgb8(4, 4), MediaType::Png).unwrap();
        let err = slot.detect(&image).unwrap_err();
        assert!(err.to_string().contains("model file missing"));
    }
}
