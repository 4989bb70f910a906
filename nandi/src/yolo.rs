//! COCO-trained YOLO detector backing the subject presence gate.
//!
//! Expects an Ultralytics-style export: input `[1, 3, S, S]` (letterboxed RGB in
//! [0,1]) and output `[1, 4 + classes, boxes]` with per-class scores.

use anyhow::{anyhow, Result};
use image::{imageops, DynamicImage, Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD};
use ort::{session::Session, value::Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::decode::DecodedImage;
use crate::detection::{Detection, ObjectDetector};
use crate::model_access::{CliModelInfo, ModelAccess};
use crate::onnx_session::{create_onnx_session, lock_session};

pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

const DEFAULT_MODEL_SIZE: u32 = 640;
const LETTERBOX_FILL: u8 = 114;

/// Candidates below this never reach the gate, unless the gate threshold is lower
pub const CANDIDATE_FLOOR: f32 = 0.1;
pub const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Score floor for a gate threshold: never drops a candidate the gate could accept
pub fn candidate_floor(gate_threshold: f32) -> f32 {
    CANDIDATE_FLOOR.min(gate_threshold)
}

pub struct DetectorModel;

impl ModelAccess for DetectorModel {
    fn model_name() -> &'static str {
        "detector"
    }

    fn path_env_var() -> &'static str {
        "NANDI_DETECTOR_MODEL_PATH"
    }

    fn url_env_var() -> Option<&'static str> {
        Some("NANDI_DETECTOR_MODEL_URL")
    }

    fn checksum_env_var() -> Option<&'static str> {
        Some("NANDI_DETECTOR_MODEL_CHECKSUM")
    }
}

/// Box in model input coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    class_id: usize,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Per-class non-maximum suppression
fn nms(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    let mut by_class: HashMap<usize, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        by_class.entry(candidate.class_id).or_default().push(candidate);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.score.total_cmp(&a.score));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            kept.push(group[i]);
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].iou(&group[j]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }
    kept
}

fn label_for(class_id: usize, labels: &[&str]) -> String {
    labels
        .get(class_id)
        .map(|l| l.to_string())
        .unwrap_or_else(|| format!("class_{class_id}"))
}

/// Turn a raw `[1, 4 + classes, boxes]` output into labelled detections, best first
pub fn postprocess(
    output: &ArrayViewD<'_, f32>,
    labels: &[&str],
    score_floor: f32,
    iou_threshold: f32,
) -> Result<Vec<Detection>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
        return Err(anyhow!(
            "Expected detector output of shape [1, 4 + classes, boxes], got {shape:?}"
        ));
    }
    let num_classes = shape[1] - 4;
    let num_boxes = shape[2];

    let mut candidates = Vec::new();
    for i in 0..num_boxes {
        let mut best_score = f32::NEG_INFINITY;
        let mut best_class = 0;
        for class_idx in 0..num_classes {
            let score = output[[0, 4 + class_idx, i]];
            // NaN never compares greater; make it win so the gate sees it
            if score.is_nan() || score > best_score {
                best_score = score;
                best_class = class_idx;
                if score.is_nan() {
                    break;
                }
            }
        }

        if best_score.is_nan() || best_score >= score_floor {
            let (cx, cy, w, h) = (
                output[[0, 0, i]],
                output[[0, 1, i]],
                output[[0, 2, i]],
                output[[0, 3, i]],
            );
            candidates.push(Candidate {
                x1: cx - w / 2.0,
                y1: cy - h / 2.0,
                x2: cx + w / 2.0,
                y2: cy + h / 2.0,
                score: best_score,
                class_id: best_class,
            });
        }
    }

    let mut kept = nms(candidates, iou_threshold);
    kept.sort_by(|a, b| b.score.total_cmp(&a.score));

    Ok(kept
        .into_iter()
        .map(|c| Detection::new(label_for(c.class_id, labels), c.score))
        .collect())
}

/// Letterbox into a `size`×`size` gray canvas and convert to NCHW in [0,1]
pub fn preprocess(image: &DynamicImage, size: u32) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let scale = size as f32 / width.max(height) as f32;
    let new_width = ((width as f32 * scale) as u32).clamp(1, size);
    let new_height = ((height as f32 * scale) as u32).clamp(1, size);

    let resized = imageops::resize(&rgb, new_width, new_height, imageops::FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    imageops::overlay(
        &mut canvas,
        &resized,
        ((size - new_width) / 2) as i64,
        ((size - new_height) / 2) as i64,
    );

    let size = size as usize;
    Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

pub struct YoloDetector {
    session: Mutex<Session>,
    model_size: u32,
    input_name: String,
    output_name: String,
    score_floor: f32,
}

impl YoloDetector {
    pub fn new(session: Session, score_floor: f32) -> Self {
        let input = &session.inputs[0];
        let model_size = match &input.input_type {
            ort::value::ValueType::Tensor { shape, .. } if shape.len() == 4 && shape[3] > 0 => {
                shape[3] as u32
            }
            other => {
                log::debug!("Detector input type {other:?}; assuming {DEFAULT_MODEL_SIZE}px");
                DEFAULT_MODEL_SIZE
            }
        };
        let input_name = input.name.clone();
        let output_name = session.outputs[0].name.clone();
        log::debug!("Detector input '{input_name}' {model_size}px, output '{output_name}'");

        Self {
            session: Mutex::new(session),
            model_size,
            input_name,
            output_name,
            score_floor,
        }
    }

    /// Resolve, load and wrap the detector model
    pub fn load(cli: &CliModelInfo, device: &str, score_floor: f32) -> Result<Self> {
        let path = DetectorModel::resolve_model_path(cli)?;
        let (session, info) = create_onnx_session(&path, device)?;
        log::debug!(
            "Detector model {} ({} bytes, md5 {}) on {}",
            info.model_path,
            info.model_size_bytes,
            info.model_checksum,
            info.device
        );
        Ok(Self::new(session, score_floor))
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&self, image: &DecodedImage) -> Result<Vec<Detection>> {
        let input = preprocess(image.image(), self.model_size);

        let start = Instant::now();
        let input_value =
            Value::from_array(input).map_err(|e| anyhow!("Failed to create input value: {e}"))?;
        let mut session = lock_session(&self.session);
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| anyhow!("Failed to run detector: {e}"))?;
        let output = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| anyhow!("Failed to extract detector output: {e}"))?;

        let detections = postprocess(&output, &COCO_LABELS, self.score_floor, NMS_IOU_THRESHOLD)?;
        log::debug!(
            "Detector found {} candidate(s) in {:.1}ms",
            detections.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(detections)
    }
}
