//! Configuration layer separating CLI arguments from the pipeline's tunable parameters.
//!
//! - `PipelineConfig`: every threshold and limit the pipeline consults, loadable from TOML
//! - `GlobalArgs` / `AnalyzeCommand`: clap argument structs for the `nandi` binary
//!
//! CLI flags override values read from a config file, which override the built-in defaults.

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::model_access::CliModelInfo;
use crate::upload::MediaType;

/// 10 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_GATE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 16_384;
pub const DEFAULT_MAX_DECODE_ALLOC_BYTES: u64 = 512 * 1024 * 1024;

/// Parse probability value (must be between 0.0 and 1.0)
pub fn parse_probability(s: &str) -> Result<f32, String> {
    let val = s
        .parse::<f32>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !(0.0..=1.0).contains(&val) {
        return Err(format!("Must be between 0.0 and 1.0, got {val}"));
    }
    Ok(val)
}

/// Subject presence gate parameters.
///
/// COCO-trained detectors have no buffalo class; buffalo are admitted through the
/// generic "cow" label. This is a known accuracy limitation of the default label table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum score (inclusive) the best matching detection must reach
    pub threshold: f32,
    /// Detector labels accepted as cattle or buffalo (case-insensitive)
    pub target_labels: Vec<String>,
    /// Abandon the detector after this many milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_GATE_THRESHOLD,
            target_labels: vec!["cow".to_string()],
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Abandon attribute inference after this many milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Every tunable the pipeline consults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Uploads strictly larger than this are rejected
    pub max_upload_bytes: u64,
    /// Declared media types accepted by the integrity check
    pub allowed_media_types: Vec<String>,
    /// Maximum decoded width or height in pixels
    pub max_image_dimension: u32,
    /// Maximum bytes the decoder may allocate
    pub max_decode_alloc_bytes: u64,
    pub gate: GateConfig,
    pub inference: InferenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_media_types: vec![
                "image/jpeg".to_string(),
                "image/jpg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
            max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
            max_decode_alloc_bytes: DEFAULT_MAX_DECODE_ALLOC_BYTES,
            gate: GateConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a config from a TOML file. Missing keys fall back to defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: PipelineConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        log::debug!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_upload_bytes must be positive".to_string(),
            ));
        }
        if self.max_image_dimension == 0 {
            return Err(ConfigError::Invalid(
                "max_image_dimension must be positive".to_string(),
            ));
        }
        if self.allowed_media_types.is_empty() {
            return Err(ConfigError::Invalid(
                "allowed_media_types must not be empty".to_string(),
            ));
        }
        for mime in &self.allowed_media_types {
            if MediaType::from_mime(mime).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "unknown media type in allowed_media_types: '{mime}'"
                )));
            }
        }
        if !self.gate.threshold.is_finite() || !(0.0..=1.0).contains(&self.gate.threshold) {
            return Err(ConfigError::Invalid(format!(
                "gate.threshold must be between 0.0 and 1.0, got {}",
                self.gate.threshold
            )));
        }
        if self.gate.target_labels.is_empty()
            || self.gate.target_labels.iter().any(|l| l.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "gate.target_labels must contain at least one non-empty label".to_string(),
            ));
        }
        if self.gate.timeout_ms == Some(0) || self.inference.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "stage timeouts must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the declared media type is on the allow-list
    pub fn allows_media_type(&self, declared: &str) -> bool {
        let declared = declared.trim().to_ascii_lowercase();
        self.allowed_media_types
            .iter()
            .any(|allowed| allowed.trim().to_ascii_lowercase() == declared)
    }

    /// Build the effective config for an `analyze` invocation
    pub fn from_command(cmd: &AnalyzeCommand) -> Result<Self, ConfigError> {
        let mut config = match &cmd.config {
            Some(path) => Self::from_toml_file(Path::new(path))?,
            None => Self::default(),
        };

        if let Some(confidence) = cmd.confidence {
            config.gate.threshold = confidence;
        }
        if !cmd.target_labels.is_empty() {
            config.gate.target_labels = cmd.target_labels.clone();
        }
        if cmd.gate_timeout_ms.is_some() {
            config.gate.timeout_ms = cmd.gate_timeout_ms;
        }
        if cmd.inference_timeout_ms.is_some() {
            config.inference.timeout_ms = cmd.inference_timeout_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Global CLI arguments that apply to all nandi commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Write a `<stem>.nandi.toml` report for each analyzed image
    #[arg(long, global = true)]
    pub metadata: bool,

    /// Directory for report files (defaults to next to the input)
    #[arg(long, global = true)]
    pub output_dir: Option<String>,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv/-vvvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Device to use for inference (auto, cpu, coreml)
    #[arg(long, default_value = "auto", global = true)]
    pub device: String,

    /// Disable colored output (also respects NO_COLOR and NANDI_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// CLI command for analyzing a single image
#[derive(Parser, Debug, Clone)]
pub struct AnalyzeCommand {
    /// Path to the image to analyze
    #[arg(value_name = "IMAGE")]
    pub image: String,

    /// Declared media type (defaults to the type implied by the file extension)
    #[arg(long)]
    pub media_type: Option<String>,

    /// Pipeline config file (TOML)
    #[arg(long, env = "NANDI_CONFIG")]
    pub config: Option<String>,

    /// Gate confidence threshold (0.0-1.0)
    #[arg(short, long, value_parser = parse_probability)]
    pub confidence: Option<f32>,

    /// Detector label accepted as cattle/buffalo (repeatable)
    #[arg(long = "target-label", value_name = "LABEL")]
    pub target_labels: Vec<String>,

    /// Timeout for the subject presence gate in milliseconds
    #[arg(long)]
    pub gate_timeout_ms: Option<u64>,

    /// Timeout for attribute inference in milliseconds
    #[arg(long)]
    pub inference_timeout_ms: Option<u64>,

    /// Path to a custom detector model file
    #[arg(long)]
    pub detector_model_path: Option<String>,

    /// URL to download a custom detector model from
    #[arg(long)]
    pub detector_model_url: Option<String>,

    /// MD5 checksum for detector model verification (used with --detector-model-url)
    #[arg(long)]
    pub detector_model_checksum: Option<String>,

    /// Path to a custom attribute model file
    #[arg(long)]
    pub attribute_model_path: Option<String>,

    /// URL to download a custom attribute model from
    #[arg(long)]
    pub attribute_model_url: Option<String>,

    /// MD5 checksum for attribute model verification (used with --attribute-model-url)
    #[arg(long)]
    pub attribute_model_checksum: Option<String>,

    /// Breed/coat label catalog for the attribute model (TOML)
    #[arg(long)]
    pub catalog: Option<String>,

    /// Print the result as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

impl AnalyzeCommand {
    pub fn detector_model_info(&self) -> CliModelInfo {
        CliModelInfo {
            model_path: self.detector_model_path.clone(),
            model_url: self.detector_model_url.clone(),
            model_checksum: self.detector_model_checksum.clone(),
        }
    }

    pub fn attribute_model_info(&self) -> CliModelInfo {
        CliModelInfo {
            model_path: self.attribute_model_path.clone(),
            model_url: self.attribute_model_url.clone(),
            model_checksum: self.attribute_model_checksum.clone(),
        }
    }
}
