//! Multi-head ONNX attribute model.
//!
//! One forward pass over a 224×224 RGB crop yields every attribute head:
//!
//! | output         | shape          | meaning                                   |
//! |----------------|----------------|-------------------------------------------|
//! | `breed`        | `[1, breeds]`  | logits over [`BreedCatalog::breeds`]      |
//! | `gender`       | `[1, 2]`       | logits over Male, Female                  |
//! | `hump`         | `[1, 4]`       | logits over None, Small, Medium, Large    |
//! | `horns`        | `[1, 4]`       | logits over None, Short, Curved, Straight |
//! | `coat_color`   | `[1, colors]`  | logits over [`BreedCatalog::coat_colors`] |
//! | `coat_pattern` | `[1, patterns]`| logits over [`BreedCatalog::coat_patterns`]|
//! | `quality`      | `[1, 4]`       | overall, health, build, conformation      |

use anyhow::{anyhow, Result};
use image::{imageops, DynamicImage};
use ndarray::Array4;
use ort::{session::Session, value::Value};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::analysis::{Category, HornType, Horns, Hump, HumpSize, Sex};
use crate::decode::DecodedImage;
use crate::error::ConfigError;
use crate::inference::{AttributeModel, AttributePrediction, RawQuality};
use crate::model_access::{CliModelInfo, ModelAccess};
use crate::onnx_session::{create_onnx_session, lock_session};

pub const INPUT_SIZE: u32 = 224;

const SEXES: [Sex; 2] = [Sex::Male, Sex::Female];

pub struct AttributeModelAccess;

impl ModelAccess for AttributeModelAccess {
    fn model_name() -> &'static str {
        "attribute"
    }

    fn path_env_var() -> &'static str {
        "NANDI_ATTRIBUTE_MODEL_PATH"
    }

    fn url_env_var() -> Option<&'static str> {
        Some("NANDI_ATTRIBUTE_MODEL_URL")
    }

    fn checksum_env_var() -> Option<&'static str> {
        Some("NANDI_ATTRIBUTE_MODEL_CHECKSUM")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreedEntry {
    pub name: String,
    pub category: Category,
}

/// Class labels for the catalog-dependent heads, in model output order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreedCatalog {
    pub breeds: Vec<BreedEntry>,
    pub coat_colors: Vec<String>,
    pub coat_patterns: Vec<String>,
}

impl Default for BreedCatalog {
    fn default() -> Self {
        let breed = |name: &str, category| BreedEntry {
            name: name.to_string(),
            category,
        };
        Self {
            breeds: vec![
                breed("Holstein Friesian", Category::Cattle),
                breed("Murrah Buffalo", Category::Buffalo),
                breed("Zebu Cattle", Category::Cattle),
            ],
            coat_colors: ["Black and White", "Black", "Brown"]
                .map(String::from)
                .to_vec(),
            coat_patterns: ["Spotted", "Solid"].map(String::from).to_vec(),
        }
    }
}

impl BreedCatalog {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let catalog: BreedCatalog =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        catalog.validate()?;
        log::debug!(
            "Loaded breed catalog from {} ({} breeds)",
            path.display(),
            catalog.breeds.len()
        );
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breeds.is_empty() || self.breeds.iter().any(|b| b.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "catalog needs at least one breed, all with non-empty names".to_string(),
            ));
        }
        if self.coat_colors.is_empty() || self.coat_patterns.is_empty() {
            return Err(ConfigError::Invalid(
                "catalog needs at least one coat color and one coat pattern".to_string(),
            ));
        }
        Ok(())
    }
}

/// Raw per-head outputs of one forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutputs {
    pub breed: Vec<f32>,
    pub gender: Vec<f32>,
    pub hump: Vec<f32>,
    pub horns: Vec<f32>,
    pub coat_color: Vec<f32>,
    pub coat_pattern: Vec<f32>,
    pub quality: Vec<f32>,
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and probability of the most likely class. Ties keep the lowest index.
fn top_class(name: &str, logits: &[f32], expected: usize) -> Result<(usize, f32)> {
    if logits.len() != expected {
        return Err(anyhow!(
            "Head '{name}' has {} outputs, expected {expected}",
            logits.len()
        ));
    }
    let probs = softmax(logits);
    let mut best = (0, probs[0]);
    for (i, &p) in probs.iter().enumerate().skip(1) {
        if p > best.1 {
            best = (i, p);
        }
    }
    Ok(best)
}

/// Map head outputs onto labels
pub fn interpret(heads: &HeadOutputs, catalog: &BreedCatalog) -> Result<AttributePrediction> {
    let (breed_idx, breed_confidence) = top_class("breed", &heads.breed, catalog.breeds.len())?;
    let (sex_idx, gender_confidence) = top_class("gender", &heads.gender, SEXES.len())?;
    let (hump_idx, _) = top_class("hump", &heads.hump, HumpSize::ALL.len())?;
    let (horn_idx, _) = top_class("horns", &heads.horns, HornType::ALL.len())?;
    let (color_idx, _) = top_class("coat_color", &heads.coat_color, catalog.coat_colors.len())?;
    let (pattern_idx, _) = top_class(
        "coat_pattern",
        &heads.coat_pattern,
        catalog.coat_patterns.len(),
    )?;

    let [overall, health, build, conformation] = heads.quality[..] else {
        return Err(anyhow!(
            "Head 'quality' has {} outputs, expected 4",
            heads.quality.len()
        ));
    };

    let breed = &catalog.breeds[breed_idx];
    let hump_size = HumpSize::ALL[hump_idx];
    let horn_type = HornType::ALL[horn_idx];

    Ok(AttributePrediction {
        breed_name: breed.name.clone(),
        breed_confidence,
        category: breed.category,
        gender: SEXES[sex_idx],
        gender_confidence,
        hump: Hump {
            present: hump_size != HumpSize::None,
            size: hump_size,
        },
        horns: Horns {
            present: horn_type != HornType::None,
            horn_type,
        },
        coat_color: catalog.coat_colors[color_idx].clone(),
        coat_pattern: catalog.coat_patterns[pattern_idx].clone(),
        quality: RawQuality {
            overall,
            health,
            build,
            conformation,
        },
    })
}

/// Resize to `size`×`size` RGB and convert to NCHW in [0,1]
pub fn preprocess(image: &DynamicImage, size: u32) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, size, size, imageops::FilterType::Triangle);
    let size = size as usize;
    Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

pub struct OnnxAttributeModel {
    session: Mutex<Session>,
    input_name: String,
    catalog: BreedCatalog,
}

impl OnnxAttributeModel {
    pub fn new(session: Session, catalog: BreedCatalog) -> Result<Self> {
        let outputs: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
        for required in [
            "breed",
            "gender",
            "hump",
            "horns",
            "coat_color",
            "coat_pattern",
            "quality",
        ] {
            if !outputs.contains(&required) {
                return Err(anyhow!(
                    "Attribute model is missing output '{required}' (has {outputs:?})"
                ));
            }
        }
        let input_name = session.inputs[0].name.clone();
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            catalog,
        })
    }

    pub fn load(cli: &CliModelInfo, device: &str, catalog: BreedCatalog) -> Result<Self> {
        let path = AttributeModelAccess::resolve_model_path(cli)?;
        let (session, info) = create_onnx_session(&path, device)?;
        log::debug!(
            "Attribute model {} ({} bytes, md5 {}) on {}",
            info.model_path,
            info.model_size_bytes,
            info.model_checksum,
            info.device
        );
        Self::new(session, catalog)
    }
}

impl AttributeModel for OnnxAttributeModel {
    fn predict(&self, image: &DecodedImage) -> Result<AttributePrediction> {
        let input = preprocess(image.image(), INPUT_SIZE);
        let input_value =
            Value::from_array(input).map_err(|e| anyhow!("Failed to create input value: {e}"))?;

        let mut session = lock_session(&self.session);
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| anyhow!("Failed to run attribute model: {e}"))?;

        let head = |name: &str| -> Result<Vec<f32>> {
            let view = outputs[name]
                .try_extract_array::<f32>()
                .map_err(|e| anyhow!("Failed to extract output '{name}': {e}"))?;
            Ok(view.iter().copied().collect())
        };

        let heads = HeadOutputs {
            breed: head("breed")?,
            gender: head("gender")?,
            hump: head("hump")?,
            horns: head("horns")?,
            coat_color: head("coat_color")?,
            coat_pattern: head("coat_pattern")?,
            quality: head("quality")?,
        };
        interpret(&heads, &self.catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn heads() -> HeadOutputs {
        HeadOutputs {
            breed: vec![0.1, 3.0, 0.2],
            gender: vec![2.0, 0.5],
            hump: vec![0.0, 0.1, 2.5, 0.3],
            horns: vec![0.0, 0.2, 3.0, 0.1],
            coat_color: vec![0.0, 4.0, 1.0],
            coat_pattern: vec![0.2, 1.5],
            quality: vec![79.4, 85.0, 78.0, 74.2],
        }
    }

    #[test]
    fn test_softmax() {
        let probs = softmax(&[1.0, 1.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);

        let probs = softmax(&[1000.0, 0.0]);
        assert!(probs[0].is_finite());
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_interpret_maps_labels() {
        let prediction = interpret(&heads(), &BreedCatalog::default()).unwrap();
        assert_eq!(prediction.breed_name, "Murrah Buffalo");
        assert_eq!(prediction.category, Category::Buffalo);
        assert!(prediction.breed_confidence > 0.8 && prediction.breed_confidence < 1.0);
        assert_eq!(prediction.gender, Sex::Male);
        assert_eq!(prediction.hump.size, HumpSize::Medium);
        assert!(prediction.hump.present);
        assert_eq!(prediction.horns.horn_type, HornType::Curved);
        assert_eq!(prediction.coat_color, "Black");
        assert_eq!(prediction.coat_pattern, "Solid");
        assert_eq!(prediction.quality.overall, 79.4);
    }

    #[test]
    fn test_none_class_means_absent() {
        let mut h = heads();
        h.hump = vec![5.0, 0.0, 0.0, 0.0];
        h.horns = vec![5.0, 0.0, 0.0, 0.0];
        let prediction = interpret(&h, &BreedCatalog::default()).unwrap();
        assert!(!prediction.hump.present);
        assert!(!prediction.horns.present);
    }

    #[test]
    fn test_head_size_mismatch_is_an_error() {
        let mut h = heads();
        h.breed = vec![1.0, 2.0];
        assert!(interpret(&h, &BreedCatalog::default()).is_err());

        let mut h = heads();
        h.quality = vec![50.0; 3];
        assert!(interpret(&h, &BreedCatalog::default()).is_err());
    }

    #[test]
    fn test_catalog_from_toml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("catalog.toml");
        std::fs::write(
            &path,
            r#"
coat_colors = ["Red", "Grey"]
coat_patterns = ["Solid"]

[[breeds]]
name = "Gir"
category = "Cattle"

[[breeds]]
name = "Jaffarabadi"
category = "Buffalo"
"#,
        )
        .unwrap();

        let catalog = BreedCatalog::from_toml_file(&path).unwrap();
        assert_eq!(catalog.breeds.len(), 2);
        assert_eq!(catalog.breeds[1].category, Category::Buffalo);
        assert_eq!(catalog.coat_colors, vec!["Red", "Grey"]);
    }

    #[test]
    fn test_empty_catalog_rejected() {
        let catalog = BreedCatalog {
            breeds: vec![],
            ..Default::default()
        };
        assert!(catalog.validate().is_err());
        assert!(BreedCatalog::default().validate().is_ok());
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let img = DynamicImage::new_rgb8(500, 300);
        let input = preprocess(&img, INPUT_SIZE);
        assert_eq!(input.shape(), &[1, 3, 224, 224]);
        assert!(input.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
