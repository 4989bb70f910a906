//! The assessment handed to the presentation layer when every stage passes.
//!
//! Field names serialize in camelCase to match the rendering contract
//! (`qualityScore`, horn `type`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Cattle,
    Buffalo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breed {
    pub name: String,
    pub confidence: f32,
    pub category: Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gender {
    pub prediction: Sex,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HumpSize {
    None,
    Small,
    Medium,
    Large,
}

impl HumpSize {
    pub const ALL: [HumpSize; 4] = [
        HumpSize::None,
        HumpSize::Small,
        HumpSize::Medium,
        HumpSize::Large,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HornType {
    None,
    Short,
    Curved,
    Straight,
}

impl HornType {
    pub const ALL: [HornType; 4] = [
        HornType::None,
        HornType::Short,
        HornType::Curved,
        HornType::Straight,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hump {
    pub present: bool,
    pub size: HumpSize,
}

impl Hump {
    /// An absent hump has no size, and a sizeless hump is absent
    pub fn normalized(self) -> Self {
        if !self.present || self.size == HumpSize::None {
            Hump {
                present: false,
                size: HumpSize::None,
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horns {
    pub present: bool,
    #[serde(rename = "type")]
    pub horn_type: HornType,
}

impl Horns {
    /// Absent horns have no type, and typeless horns are absent
    pub fn normalized(self) -> Self {
        if !self.present || self.horn_type == HornType::None {
            Horns {
                present: false,
                horn_type: HornType::None,
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coat {
    pub color: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub hump: Hump,
    pub horns: Horns,
    pub coat: Coat,
}

/// Quality sub-scores, each an integer in [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityScore {
    pub overall: u8,
    pub health: u8,
    pub build: u8,
    pub conformation: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub breed: Breed,
    pub gender: Gender,
    pub features: Features,
    pub quality_score: QualityScore,
}

impl AnalysisResult {
    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:.0}%) | {:?} ({:.0}%) | quality {}/100",
            self.breed.name,
            self.breed.category,
            self.breed.confidence * 100.0,
            self.gender.prediction,
            self.gender.confidence * 100.0,
            self.quality_score.overall
        )
    }

    /// Whether every documented invariant of the result holds
    pub fn is_well_formed(&self) -> bool {
        let unit = |c: f32| c.is_finite() && (0.0..=1.0).contains(&c);
        let q = &self.quality_score;
        unit(self.breed.confidence)
            && unit(self.gender.confidence)
            && [q.overall, q.health, q.build, q.conformation]
                .iter()
                .all(|s| *s <= 100)
            && (self.features.hump.present || self.features.hump.size == HumpSize::None)
            && (self.features.horns.present || self.features.horns.horn_type == HornType::None)
    }
}
