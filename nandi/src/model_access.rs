//! Where model files come from.
//!
//! Resolution order, first match wins:
//! 1. `--<model>-model-path`
//! 2. `--<model>-model-url` (+ optional `--<model>-model-checksum`), via the download cache
//! 3. the model's path environment variable
//! 4. the model's URL environment variable (+ checksum variable), via the download cache
//!
//! There are no built-in downloads: with none of these set, loading fails.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

use crate::model_cache::{get_or_download_model, validate_model_file};

/// A downloadable model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub url: String,
    pub md5_checksum: Option<String>,
    pub filename: String,
}

impl ModelInfo {
    /// Model info for an arbitrary URL; the cache file is named after the last path segment
    pub fn from_url(name: &str, url: &str, md5_checksum: Option<String>) -> Self {
        let filename = url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|f| !f.is_empty())
            .unwrap_or("model.onnx")
            .to_string();
        Self {
            name: name.to_string(),
            url: url.to_string(),
            md5_checksum,
            filename,
        }
    }
}

/// Model location given on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliModelInfo {
    pub model_path: Option<String>,
    pub model_url: Option<String>,
    pub model_checksum: Option<String>,
}

impl CliModelInfo {
    pub fn validate(&self) -> Result<()> {
        if self.model_path.is_some() && self.model_url.is_some() {
            return Err(anyhow!(
                "Cannot specify both a model path and a model URL. Choose one."
            ));
        }
        if self.model_checksum.is_some() && self.model_url.is_none() {
            return Err(anyhow!(
                "A model checksum can only be used together with a model URL"
            ));
        }
        Ok(())
    }
}

/// Per-model naming of overrides
pub trait ModelAccess {
    /// Human-readable model name for logs and errors
    fn model_name() -> &'static str;

    /// Environment variable holding a local model path
    fn path_env_var() -> &'static str;

    fn url_env_var() -> Option<&'static str> {
        None
    }

    fn checksum_env_var() -> Option<&'static str> {
        None
    }

    /// Resolve the model to a local file, downloading it if needed
    fn resolve_model_path(cli: &CliModelInfo) -> Result<PathBuf>
    where
        Self: Sized,
    {
        resolve_model_path::<Self>(cli)
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn local_model(path: &str, origin: &str) -> Result<PathBuf> {
    let path = PathBuf::from(path);
    if !path.exists() {
        return Err(anyhow!(
            "Model path from {origin} does not exist: {}",
            path.display()
        ));
    }
    validate_model_file(&path)?;
    Ok(path)
}

fn downloaded_model(info: &ModelInfo) -> Result<PathBuf> {
    let path = get_or_download_model(&info.url, &info.filename, info.md5_checksum.as_deref())?;
    validate_model_file(&path)?;
    Ok(path)
}

pub fn resolve_model_path<T: ModelAccess>(cli: &CliModelInfo) -> Result<PathBuf> {
    cli.validate()?;

    if let Some(path) = &cli.model_path {
        log::info!("Using CLI-provided {} model: {path}", T::model_name());
        return local_model(path, "the command line");
    }

    if let Some(url) = &cli.model_url {
        log::info!("Using CLI-provided {} model URL: {url}", T::model_name());
        let info = ModelInfo::from_url(T::model_name(), url, cli.model_checksum.clone());
        return downloaded_model(&info);
    }

    if let Some(path) = non_empty_env(T::path_env_var()) {
        log::debug!("Using {} model from {}: {path}", T::model_name(), T::path_env_var());
        return local_model(&path, T::path_env_var());
    }

    if let Some(url) = T::url_env_var().and_then(non_empty_env) {
        log::debug!("Using {} model URL from environment: {url}", T::model_name());
        let checksum = T::checksum_env_var().and_then(non_empty_env);
        let info = ModelInfo::from_url(T::model_name(), &url, checksum);
        return downloaded_model(&info);
    }

    Err(anyhow!(
        "No {} model configured. Pass a model path or URL on the command line, or set {}",
        T::model_name(),
        T::path_env_var()
    ))
}
