//! `<stem>.nandi.toml` report written next to the analyzed image (or into `--output-dir`).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::analysis::AnalysisResult;
use crate::config::PipelineConfig;
use crate::error::PipelineFailure;
use crate::gate::GateDecision;
use crate::pipeline::{AnalysisOutcome, StageTiming};
use crate::upload::RawUpload;

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub timestamp: DateTime<Utc>,
    pub total_processing_time_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nandi_env_vars: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputInfo {
    pub path: String,
    pub declared_media_type: String,
    pub byte_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub tool: ToolInfo,
    pub execution: ExecutionContext,
    pub input: InputInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineFailure>,
    pub timings: Vec<StageTiming>,
    pub config: PipelineConfig,
}

/// `NANDI_*` variables that are set and non-empty
pub fn collect_nandi_env_vars() -> Option<BTreeMap<String, String>> {
    let vars: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, value)| key.starts_with("NANDI_") && !value.is_empty())
        .collect();
    if vars.is_empty() {
        None
    } else {
        Some(vars)
    }
}

/// Report path for `input_path`: `<stem>.nandi.toml`
pub fn metadata_path(input_path: &Path, output_dir: Option<&str>) -> Result<PathBuf> {
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("Invalid input filename: {}", input_path.display()))?;
    let filename = format!("{stem}.nandi.toml");

    Ok(match output_dir {
        Some(dir) => Path::new(dir).join(filename),
        None => input_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(filename),
    })
}

impl AnalysisReport {
    pub fn new(
        input_path: &Path,
        upload: &RawUpload,
        config: &PipelineConfig,
        outcome: &AnalysisOutcome,
        total_processing_time_ms: f64,
    ) -> Self {
        Self {
            tool: ToolInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            execution: ExecutionContext {
                timestamp: Utc::now(),
                total_processing_time_ms,
                success: outcome.result.is_ok(),
                nandi_env_vars: collect_nandi_env_vars(),
            },
            input: InputInfo {
                path: input_path.display().to_string(),
                declared_media_type: upload.media_type().to_string(),
                byte_length: upload.byte_length(),
                width: outcome.dimensions.map(|(w, _)| w),
                height: outcome.dimensions.map(|(_, h)| h),
            },
            gate: outcome.gate.clone(),
            result: outcome.result.as_ref().ok().cloned(),
            failure: outcome.result.as_ref().err().copied(),
            timings: outcome.timings.clone(),
            config: config.clone(),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| anyhow!("Failed to serialize report: {e}"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        log::debug!("Report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureReason, Stage};
    use crate::pipeline::PipelineState;

    fn failed_outcome() -> AnalysisOutcome {
        AnalysisOutcome {
            result: Err(PipelineFailure::new(
                Stage::SubjectPresenceGate,
                FailureReason::SubjectNotDetected,
            )),
            final_state: PipelineState::Failed(
                Stage::SubjectPresenceGate,
                FailureReason::SubjectNotDetected,
            ),
            media_type: None,
            dimensions: Some((640, 480)),
            gate: None,
            timings: vec![StageTiming {
                stage: Stage::FileIntegrityCheck,
                elapsed_ms: 0.1,
            }],
        }
    }

    #[test]
    fn test_metadata_path() {
        let path = metadata_path(Path::new("/data/herd/cow1.jpg"), None).unwrap();
        assert_eq!(path, PathBuf::from("/data/herd/cow1.nandi.toml"));

        let path = metadata_path(Path::new("/data/herd/cow1.jpg"), Some("/out")).unwrap();
        assert_eq!(path, PathBuf::from("/out/cow1.nandi.toml"));
    }

    #[test]
    fn test_failure_report_toml() {
        let upload = RawUpload::new(vec![0u8; 42], "image/jpeg");
        let report = AnalysisReport::new(
            Path::new("dog.jpg"),
            &upload,
            &PipelineConfig::default(),
            &failed_outcome(),
            12.5,
        );

        let text = report.to_toml().unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(parsed["tool"]["name"].as_str(), Some("nandi"));
        assert_eq!(parsed["execution"]["success"].as_bool(), Some(false));
        assert_eq!(parsed["input"]["byte_length"].as_integer(), Some(42));
        assert_eq!(parsed["input"]["width"].as_integer(), Some(640));
        assert_eq!(
            parsed["failure"]["reason"].as_str(),
            Some("SUBJECT_NOT_DETECTED")
        );
        assert_eq!(
            parsed["failure"]["stage"].as_str(),
            Some("SubjectPresenceGate")
        );
        assert!(parsed.get("result").is_none());
        assert_eq!(parsed["config"]["gate"]["threshold"].as_float(), Some(0.5));
    }

    #[test]
    fn test_save_creates_output_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("reports").join("cow.nandi.toml");
        let upload = RawUpload::new(vec![1, 2, 3], "image/png");
        AnalysisReport::new(
            Path::new("cow.png"),
            &upload,
            &PipelineConfig::default(),
            &failed_outcome(),
            1.0,
        )
        .save(&path)
        .unwrap();
        assert!(path.exists());
    }
}
