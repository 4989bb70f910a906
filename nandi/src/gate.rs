//! Subject presence gate.
//!
//! Runs a general-purpose object detector and admits the image only when a
//! detection carrying one of the target labels reaches the confidence threshold.
//! The gate fails closed: detector errors, panics and malformed scores all reject.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::config::GateConfig;
use crate::decode::DecodedImage;
use crate::detection::{Detection, ObjectDetector};
use crate::error::FailureReason;

/// The detection that let the image through
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub label: String,
    pub score: f32,
}

fn label_matches(label: &str, targets: &[String]) -> bool {
    let label = label.trim();
    targets.iter().any(|t| t.trim().eq_ignore_ascii_case(label))
}

/// Highest-scoring detection with a target label. Ties keep the first occurrence.
pub fn best_match<'a>(detections: &'a [Detection], targets: &[String]) -> Option<&'a Detection> {
    let mut best: Option<&Detection> = None;
    for detection in detections
        .iter()
        .filter(|d| label_matches(&d.label, targets))
    {
        match best {
            Some(current) if detection.score <= current.score => {}
            _ => best = Some(detection),
        }
    }
    best
}

/// Accept or reject a set of detections without running a detector
pub fn evaluate(detections: &[Detection], config: &GateConfig) -> Result<GateDecision, FailureReason> {
    if let Some(bad) = detections
        .iter()
        .find(|d| !d.score.is_finite() || !(0.0..=1.0).contains(&d.score))
    {
        log::warn!(
            "Detector returned malformed score {} for '{}'",
            bad.score,
            bad.label
        );
        return Err(FailureReason::GateUnavailable);
    }

    match best_match(detections, &config.target_labels) {
        Some(best) if best.score >= config.threshold => {
            log::debug!(
                "Gate accepted: '{}' at {:.3} (threshold {:.2})",
                best.label,
                best.score,
                config.threshold
            );
            Ok(GateDecision {
                label: best.label.clone(),
                score: best.score,
            })
        }
        Some(best) => {
            log::debug!(
                "Gate rejected: best '{}' at {:.3} below threshold {:.2}",
                best.label,
                best.score,
                config.threshold
            );
            Err(FailureReason::SubjectNotDetected)
        }
        None => {
            log::debug!(
                "Gate rejected: none of {} detection(s) matched {:?}",
                detections.len(),
                config.target_labels
            );
            Err(FailureReason::SubjectNotDetected)
        }
    }
}

/// Run the detector over `image` and apply the gate
pub fn gate(
    image: &DecodedImage,
    detector: &dyn ObjectDetector,
    config: &GateConfig,
) -> Result<GateDecision, FailureReason> {
    let detections = match catch_unwind(AssertUnwindSafe(|| detector.detect(image))) {
        Ok(Ok(detections)) => detections,
        Ok(Err(e)) => {
            log::warn!("Subject detector failed: {e:#}");
            return Err(FailureReason::GateUnavailable);
        }
        Err(_) => {
            log::warn!("Subject detector panicked");
            return Err(FailureReason::GateUnavailable);
        }
    };

    log::trace!("Detections: {detections:?}");
    evaluate(&detections, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::MediaType;
    use image::DynamicImage;

    struct StubDetector(Vec<Detection>);

    impl ObjectDetector for StubDetector {
        fn detect(&self, _image: &DecodedImage) -> anyhow::Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl ObjectDetector for FailingDetector {
        fn detect(&self, _image: &DecodedImage) -> anyhow::Result<Vec<Detection>> {
            Err(anyhow::anyhow!("inference exploded"))
        }
    }

    struct PanickingDetector;

    impl ObjectDetector for PanickingDetector {
        fn detect(&self, _image: &DecodedImage) -> anyhow::Result<Vec<Detection>> {
            panic!("detector bug")
        }
    }

    fn image() -> DecodedImage {
        DecodedImage::new(DynamicImage::new_rgb8(8, 8), MediaType::Jpeg).unwrap()
    }

    fn run(detections: Vec<Detection>) -> Result<GateDecision, FailureReason> {
        gate(&image(), &StubDetector(detections), &GateConfig::default())
    }

    #[test]
    fn test_cow_above_threshold_accepted() {
        let decision = run(vec![Detection::new("cow", 0.9)]).unwrap();
        assert_eq!(decision.label, "cow");
        assert_eq!(decision.score, 0.9);
    }

    #[test]
    fn test_cow_below_threshold_rejected() {
        assert_eq!(
            run(vec![Detection::new("cow", 0.4)]),
            Err(FailureReason::SubjectNotDetected)
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(run(vec![Detection::new("cow", 0.5)]).is_ok());
    }

    #[test]
    fn test_other_animals_rejected() {
        assert_eq!(
            run(vec![Detection::new("dog", 0.99), Detection::new("horse", 0.8)]),
            Err(FailureReason::SubjectNotDetected)
        );
        assert_eq!(run(vec![]), Err(FailureReason::SubjectNotDetected));
    }

    #[test]
    fn test_best_cow_wins_over_weak_ones() {
        let decision = run(vec![
            Detection::new("cow", 0.3),
            Detection::new("dog", 0.95),
            Detection::new("Cow", 0.7),
        ])
        .unwrap();
        assert_eq!(decision.label, "Cow");
        assert_eq!(decision.score, 0.7);
    }

    #[test]
    fn test_ties_keep_first_occurrence() {
        let detections = vec![
            Detection::new("cow", 0.8),
            Detection::new("COW", 0.8),
        ];
        let best = best_match(&detections, &["cow".to_string()]).unwrap();
        assert_eq!(best.label, "cow");
    }

    #[test]
    fn test_failing_detector_fails_closed() {
        let result = gate(&image(), &FailingDetector, &GateConfig::default());
        assert_eq!(result, Err(FailureReason::GateUnavailable));
    }

    #[test]
    fn test_panicking_detector_fails_closed() {
        let result = gate(&image(), &PanickingDetector, &GateConfig::default());
        assert_eq!(result, Err(FailureReason::GateUnavailable));
    }

    #[test]
    fn test_malformed_scores_fail_closed() {
        assert_eq!(
            run(vec![Detection::new("cow", f32::NAN)]),
            Err(FailureReason::GateUnavailable)
        );
        assert_eq!(
            run(vec![Detection::new("dog", 1.2), Detection::new("cow", 0.9)]),
            Err(FailureReason::GateUnavailable)
        );
    }

    #[test]
    fn test_tunable_threshold_and_labels() {
        let config = GateConfig {
            threshold: 0.3,
            target_labels: vec!["cow".to_string(), "sheep".to_string()],
            timeout_ms: None,
        };
        let decision = evaluate(&[Detection::new("sheep", 0.35)], &config).unwrap();
        assert_eq!(decision.label, "sheep");

        let strict = GateConfig {
            threshold: 0.95,
            ..Default::default()
        };
        assert_eq!(
            evaluate(&[Detection::new("cow", 0.9)], &strict),
            Err(FailureReason::SubjectNotDetected)
        );
    }
}
