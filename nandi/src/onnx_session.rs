//! ONNX Runtime session construction shared by the detector and the attribute model.

use anyhow::{anyhow, Result};
use log::Level;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
        ExecutionProviderDispatch,
    },
    logging::LogLevel,
    session::Session,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::color_utils::symbols;
use crate::model_cache::{calculate_md5_bytes, get_coreml_cache_dir};

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose => Level::Trace,
        LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX "info" is chatty enough to count as trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub model_path: String,
    pub model_size_bytes: usize,
    pub model_checksum: String,
    pub device: String,
    pub execution_providers: Vec<String>,
}

/// Resolve `auto` to a concrete device
pub fn determine_optimal_device(requested_device: &str) -> String {
    match requested_device {
        "auto" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => {
                log::debug!("Auto-selected CoreML (available)");
                "coreml".to_string()
            }
            _ => {
                log::debug!("Auto-selected CPU (CoreML not available)");
                "cpu".to_string()
            }
        },
        other => other.to_string(),
    }
}

/// CoreML compiles models on first use; key the cache by model content and crate version
fn coreml_cache_dir(model_bytes: &[u8]) -> Option<PathBuf> {
    let base = match get_coreml_cache_dir() {
        Ok(base) => base,
        Err(e) => {
            log::warn!("{}Failed to get CoreML cache directory: {e}", symbols::warning());
            return None;
        }
    };
    let hash = calculate_md5_bytes(model_bytes);
    let dir = base.join(format!(
        "{}_{}",
        &hash[..8],
        env!("CARGO_PKG_VERSION").replace('.', "_")
    ));
    match fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            log::warn!(
                "{}Failed to create CoreML cache directory: {e}",
                symbols::warning()
            );
            None
        }
    }
}

fn execution_providers(device: &str, model_bytes: &[u8]) -> Vec<ExecutionProviderDispatch> {
    match device {
        "coreml" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => {
                let coreml = match coreml_cache_dir(model_bytes)
                    .as_deref()
                    .and_then(Path::to_str)
                {
                    Some(dir) => CoreMLExecutionProvider::default().with_model_cache_dir(dir),
                    None => CoreMLExecutionProvider::default(),
                };
                vec![coreml.build(), CPUExecutionProvider::default().build()]
            }
            _ => {
                log::warn!(
                    "{}CoreML not available, falling back to CPU",
                    symbols::warning()
                );
                vec![CPUExecutionProvider::default().build()]
            }
        },
        "cpu" => vec![CPUExecutionProvider::default().build()],
        other => {
            log::warn!("{}Unknown device '{other}', using CPU", symbols::warning());
            vec![CPUExecutionProvider::default().build()]
        }
    }
}

/// Create a session for the model at `model_path` on `device` (auto, cpu, coreml)
pub fn create_onnx_session(model_path: &Path, device: &str) -> Result<(Session, SessionInfo)> {
    let bytes = fs::read(model_path)
        .map_err(|e| anyhow!("Failed to read model {}: {e}", model_path.display()))?;

    let device = determine_optimal_device(device);
    let providers = execution_providers(&device, &bytes);
    let provider_names: Vec<String> = providers.iter().map(|ep| format!("{ep:?}")).collect();

    // Only ask ORT for what our logger will actually print
    let ort_log_level = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
    .into_iter()
    .find(|&lvl| log::log_enabled!(lvl))
    .map(ort_level_from_log)
    .unwrap_or(LogLevel::Fatal);

    let session = Session::builder()
        .map_err(|e| anyhow!("Failed to create session builder: {e}"))?
        .with_logger(Box::new(|level, _, _, _, msg| {
            log::log!(log_level_from_ort(level), "[onnx] {msg}")
        }))
        .map_err(|e| anyhow!("Failed to set logger: {e}"))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow!("Failed to set log level: {e}"))?
        .with_execution_providers(providers)
        .map_err(|e| anyhow!("Failed to set execution providers: {e}"))?
        .commit_from_memory(&bytes)
        .map_err(|e| anyhow!("Failed to load model {}: {e}", model_path.display()))?;

    log::debug!(
        "{}Execution providers registered: {}",
        symbols::system_setup(),
        provider_names.join(" -> ")
    );

    let info = SessionInfo {
        model_path: model_path.display().to_string(),
        model_size_bytes: bytes.len(),
        model_checksum: calculate_md5_bytes(&bytes),
        device,
        execution_providers: provider_names,
    };
    Ok((session, info))
}

/// Lock a model's session, recovering it if an earlier run panicked mid-inference.
///
/// A session carries no state between runs, so a poisoned lock is safe to reuse and
/// must not disable the model for the rest of the process.
pub fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
    session.lock().unwrap_or_else(|poisoned| {
        log::warn!("Recovering session lock poisoned by an earlier panic");
        poisoned.into_inner()
    })
}
