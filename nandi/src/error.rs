//! Failure taxonomy for the classification pipeline.
//!
//! Every stage converts its own lower-level errors (decode errors, ONNX runtime
//! errors, panics) into a [`FailureReason`] at its boundary. The orchestrator
//! pairs that reason with the [`Stage`] that produced it.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    FileIntegrityCheck,
    ImageDecodabilityCheck,
    SubjectPresenceGate,
    AttributeInferenceEngine,
}

impl Stage {
    /// All stages in the order the orchestrator runs them
    pub fn all() -> [Stage; 4] {
        [
            Stage::FileIntegrityCheck,
            Stage::ImageDecodabilityCheck,
            Stage::SubjectPresenceGate,
            Stage::AttributeInferenceEngine,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FileIntegrityCheck => "FileIntegrityCheck",
            Stage::ImageDecodabilityCheck => "ImageDecodabilityCheck",
            Stage::SubjectPresenceGate => "SubjectPresenceGate",
            Stage::AttributeInferenceEngine => "AttributeInferenceEngine",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage rejected the upload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    #[error("upload exceeds the size ceiling")]
    Oversize,

    #[error("declared media type is not allowed")]
    UnsupportedType,

    #[error("image could not be decoded")]
    CorruptOrUndecodable,

    #[error("no cattle or buffalo detected")]
    SubjectNotDetected,

    #[error("subject detector unavailable")]
    GateUnavailable,

    #[error("attribute inference failed")]
    InferenceFailed,

    #[error("stage timed out")]
    Timeout,

    #[error("run was cancelled")]
    Cancelled,
}

impl FailureReason {
    /// Stable machine-readable code, e.g. `SUBJECT_NOT_DETECTED`
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Oversize => "OVERSIZE",
            FailureReason::UnsupportedType => "UNSUPPORTED_TYPE",
            FailureReason::CorruptOrUndecodable => "CORRUPT_OR_UNDECODABLE",
            FailureReason::SubjectNotDetected => "SUBJECT_NOT_DETECTED",
            FailureReason::GateUnavailable => "GATE_UNAVAILABLE",
            FailureReason::InferenceFailed => "INFERENCE_FAILED",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::Cancelled => "CANCELLED",
        }
    }

    /// Message suitable for showing to the person who uploaded the image
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureReason::Oversize => "File size exceeds the upload size limit.",
            FailureReason::UnsupportedType => {
                "Invalid file type. Only JPG, PNG, and WEBP are allowed."
            }
            FailureReason::CorruptOrUndecodable => "File is not a valid image or is corrupted.",
            FailureReason::SubjectNotDetected => {
                "Invalid animal detected! Only cattle and buffalo images can be analyzed. \
                 Please upload an image containing cattle or buffalo."
            }
            FailureReason::GateUnavailable => {
                "The animal detector is unavailable right now. Please try again later."
            }
            FailureReason::InferenceFailed => {
                "Analysis failed. Please try again with a different image."
            }
            FailureReason::Timeout => "Analysis took too long. Please try again.",
            FailureReason::Cancelled => "Analysis was cancelled.",
        }
    }
}

/// Terminal failure of a pipeline run: which stage failed and why.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[error("{stage} failed: {} ({reason})", .reason.code())]
pub struct PipelineFailure {
    pub stage: Stage,
    pub reason: FailureReason,
}

impl PipelineFailure {
    pub fn new(stage: Stage, reason: FailureReason) -> Self {
        Self { stage, reason }
    }
}

/// Errors raised while loading or validating a [`crate::config::PipelineConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
