//! Gated cattle and buffalo image classification.
//!
//! An upload passes through four stages in order, stopping at the first failure:
//! file integrity, image decoding, a subject presence gate (general-purpose object
//! detector), and attribute inference (breed, gender, physical features, quality).

pub mod analysis;
pub mod attribute_model;
pub mod color_utils;
pub mod config;
pub mod decode;
pub mod detection;
pub mod error;
pub mod gate;
pub mod inference;
pub mod integrity;
pub mod model_access;
pub mod model_cache;
pub mod model_slot;
pub mod onnx_session;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod upload;
pub mod yolo;

pub use analysis::AnalysisResult;
pub use config::PipelineConfig;
pub use detection::{Detection, ObjectDetector};
pub use error::{FailureReason, PipelineFailure, Stage};
pub use gate::GateDecision;
pub use inference::{AttributeModel, AttributePrediction};
pub use model_slot::ModelSlot;
pub use pipeline::{
    AnalysisOutcome, OnnxModelOptions, Pipeline, PipelineEvent, PipelineState, RunOptions,
};
pub use upload::{MediaType, RawUpload};
