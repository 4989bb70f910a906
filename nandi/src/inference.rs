//! Attribute inference engine.
//!
//! An [`AttributeModel`] produces a raw [`AttributePrediction`]; the engine turns it
//! into an [`AnalysisResult`] whose invariants always hold, or fails the stage as a
//! whole. Partial results are never returned.

use anyhow::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::analysis::{
    AnalysisResult, Breed, Category, Coat, Features, Gender, HornType, Horns, Hump, HumpSize,
    QualityScore, Sex,
};
use crate::decode::DecodedImage;
use crate::error::FailureReason;
use crate::model_slot::ModelSlot;

/// Quality estimates before rounding and clamping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawQuality {
    pub overall: f32,
    pub health: f32,
    pub build: f32,
    pub conformation: f32,
}

/// Unvalidated output of an attribute model
#[derive(Debug, Clone, PartialEq)]
pub struct AttributePrediction {
    pub breed_name: String,
    pub breed_confidence: f32,
    pub category: Category,
    pub gender: Sex,
    pub gender_confidence: f32,
    pub hump: Hump,
    pub horns: Horns,
    pub coat_color: String,
    pub coat_pattern: String,
    pub quality: RawQuality,
}

/// Breed, gender, feature and quality prediction for an accepted image.
///
/// May be backed by separate models or one multi-head model; the pipeline only sees
/// this single call.
pub trait AttributeModel: Send + Sync {
    fn predict(&self, image: &DecodedImage) -> Result<AttributePrediction>;
}

impl<A: AttributeModel> AttributeModel for ModelSlot<A> {
    fn predict(&self, image: &DecodedImage) -> Result<AttributePrediction> {
        self.get()?.predict(image)
    }
}

fn clamp_confidence(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

fn clamp_score(value: f32) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

/// Validate and shape a raw prediction
pub fn finalize(prediction: AttributePrediction) -> Result<AnalysisResult, FailureReason> {
    let q = prediction.quality;
    let scalars = [
        prediction.breed_confidence,
        prediction.gender_confidence,
        q.overall,
        q.health,
        q.build,
        q.conformation,
    ];
    if scalars.iter().any(|v| !v.is_finite()) {
        log::warn!("Attribute model returned a non-finite value: {scalars:?}");
        return Err(FailureReason::InferenceFailed);
    }

    let breed_name = prediction.breed_name.trim();
    if breed_name.is_empty() {
        log::warn!("Attribute model returned an empty breed name");
        return Err(FailureReason::InferenceFailed);
    }

    let label_or_unknown = |s: &str| {
        let s = s.trim();
        if s.is_empty() {
            "Unknown".to_string()
        } else {
            s.to_string()
        }
    };

    Ok(AnalysisResult {
        breed: Breed {
            name: breed_name.to_string(),
            confidence: clamp_confidence(prediction.breed_confidence),
            category: prediction.category,
        },
        gender: Gender {
            prediction: prediction.gender,
            confidence: clamp_confidence(prediction.gender_confidence),
        },
        features: Features {
            hump: prediction.hump.normalized(),
            horns: prediction.horns.normalized(),
            coat: Coat {
                color: label_or_unknown(&prediction.coat_color),
                pattern: label_or_unknown(&prediction.coat_pattern),
            },
        },
        quality_score: QualityScore {
            overall: clamp_score(q.overall),
            health: clamp_score(q.health),
            build: clamp_score(q.build),
            conformation: clamp_score(q.conformation),
        },
    })
}

/// Run the attribute model on a gate-passed image
pub fn infer(image: &DecodedImage, model: &dyn AttributeModel) -> Result<AnalysisResult, FailureReason> {
    let prediction = match catch_unwind(AssertUnwindSafe(|| model.predict(image))) {
        Ok(Ok(prediction)) => prediction,
        Ok(Err(e)) => {
            log::warn!("Attribute inference failed: {e:#}");
            return Err(FailureReason::InferenceFailed);
        }
        Err(_) => {
            log::warn!("Attribute model panicked");
            return Err(FailureReason::InferenceFailed);
        }
    };

    let result = finalize(prediction)?;
    debug_assert!(result.is_well_formed());
    log::debug!("Attributes: {}", result.summary());
    Ok(result)
}

/// A model that always answers with the same prediction
#[derive(Debug, Clone)]
pub struct FixedAttributeModel {
    prediction: AttributePrediction,
}

impl FixedAttributeModel {
    pub fn new(prediction: AttributePrediction) -> Self {
        Self { prediction }
    }
}

impl AttributeModel for FixedAttributeModel {
    fn predict(&self, _image: &DecodedImage) -> Result<AttributePrediction> {
        Ok(self.prediction.clone())
    }
}

impl From<&AnalysisResult> for AttributePrediction {
    fn from(result: &AnalysisResult) -> Self {
        let q = result.quality_score;
        AttributePrediction {
            breed_name: result.breed.name.clone(),
            breed_confidence: result.breed.confidence,
            category: result.breed.category,
            gender: result.gender.prediction,
            gender_confidence: result.gender.confidence,
            hump: result.features.hump,
            horns: result.features.horns,
            coat_color: result.features.coat.color.clone(),
            coat_pattern: result.features.coat.pattern.clone(),
            quality: RawQuality {
                overall: q.overall as f32,
                health: q.health as f32,
                build: q.build as f32,
                conformation: q.conformation as f32,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::MediaType;
    use image::DynamicImage;

    fn murrah() -> AttributePrediction {
        AttributePrediction {
            breed_name: "Murrah Buffalo".to_string(),
            breed_confidence: 0.91,
            category: Category::Buffalo,
            gender: Sex::Male,
            gender_confidence: 0.82,
            hump: Hump {
                present: true,
                size: HumpSize::Medium,
            },
            horns: Horns {
                present: true,
                horn_type: HornType::Curved,
            },
            coat_color: "Black".to_string(),
            coat_pattern: "Solid".to_string(),
            quality: RawQuality {
                overall: 79.0,
                health: 85.0,
                build: 78.0,
                conformation: 74.0,
            },
        }
    }

    fn image() -> DecodedImage {
        DecodedImage::new(DynamicImage::new_rgb8(8, 8), MediaType::Png).unwrap()
    }

    struct FailingModel;

    impl AttributeModel for FailingModel {
        fn predict(&self, _image: &DecodedImage) -> Result<AttributePrediction> {
            Err(anyhow::anyhow!("onnx runtime error"))
        }
    }

    struct PanickingModel;

    impl AttributeModel for PanickingModel {
        fn predict(&self, _image: &DecodedImage) -> Result<AttributePrediction> {
            panic!("head index out of range")
        }
    }

    #[test]
    fn test_well_formed_prediction_passes_through() {
        let result = infer(&image(), &FixedAttributeModel::new(murrah())).unwrap();
        assert_eq!(result.breed.name, "Murrah Buffalo");
        assert_eq!(result.breed.category, Category::Buffalo);
        assert_eq!(result.gender.prediction, Sex::Male);
        assert_eq!(result.features.hump.size, HumpSize::Medium);
        assert_eq!(result.quality_score.overall, 79);
        assert!(result.is_well_formed());
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let mut prediction = murrah();
        prediction.breed_confidence = 1.7;
        prediction.gender_confidence = -0.2;
        prediction.quality = RawQuality {
            overall: 130.0,
            health: -5.0,
            build: 49.6,
            conformation: 100.4,
        };

        let result = finalize(prediction).unwrap();
        assert_eq!(result.breed.confidence, 1.0);
        assert_eq!(result.gender.confidence, 0.0);
        assert_eq!(result.quality_score.overall, 100);
        assert_eq!(result.quality_score.health, 0);
        assert_eq!(result.quality_score.build, 50);
        assert_eq!(result.quality_score.conformation, 100);
        assert!(result.is_well_formed());
    }

    #[test]
    fn test_feature_invariants_enforced() {
        let mut prediction = murrah();
        prediction.hump = Hump {
            present: false,
            size: HumpSize::Large,
        };
        prediction.horns = Horns {
            present: true,
            horn_type: HornType::None,
        };

        let result = finalize(prediction).unwrap();
        assert_eq!(
            result.features.hump,
            Hump {
                present: false,
                size: HumpSize::None
            }
        );
        assert_eq!(
            result.features.horns,
            Horns {
                present: false,
                horn_type: HornType::None
            }
        );
    }

    #[test]
    fn test_non_finite_values_fail_whole_stage() {
        let mut prediction = murrah();
        prediction.quality.health = f32::NAN;
        assert_eq!(finalize(prediction), Err(FailureReason::InferenceFailed));

        let mut prediction = murrah();
        prediction.breed_confidence = f32::INFINITY;
        assert_eq!(finalize(prediction), Err(FailureReason::InferenceFailed));
    }

    #[test]
    fn test_empty_breed_name_is_malformed() {
        let mut prediction = murrah();
        prediction.breed_name = "   ".to_string();
        assert_eq!(finalize(prediction), Err(FailureReason::InferenceFailed));
    }

    #[test]
    fn test_blank_coat_labels_become_unknown() {
        let mut prediction = murrah();
        prediction.coat_pattern = String::new();
        let result = finalize(prediction).unwrap();
        assert_eq!(result.features.coat.pattern, "Unknown");
    }

    #[test]
    fn test_model_errors_map_to_inference_failed() {
        assert_eq!(
            infer(&image(), &FailingModel),
            Err(FailureReason::InferenceFailed)
        );
        assert_eq!(
            infer(&image(), &PanickingModel),
            Err(FailureReason::InferenceFailed)
        );
    }

    #[test]
    fn test_prediction_from_result_round_trips() {
        let result = finalize(murrah()).unwrap();
        let again = finalize(AttributePrediction::from(&result)).unwrap();
        assert_eq!(again, result);
    }
}
