//! On-disk model cache: directory resolution, MD5 verification and locked downloads.

use anyhow::{anyhow, Result};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::color_utils::symbols;
use crate::progress::{create_download_bar, remove_progress_bar};

/// Environment variable overriding the model download cache directory
pub const CACHE_DIR_ENV: &str = "ONNX_MODEL_CACHE_DIR";

/// Cache directory from `env_var` (with `~/` expansion) or `<platform cache>/<default_subdir>`
pub fn get_cache_dir_with_env_override(env_var: &str, default_subdir: &str) -> Result<PathBuf> {
    if let Ok(cache_dir) = std::env::var(env_var) {
        if let Some(stripped) = cache_dir.strip_prefix("~/") {
            if let Some(home_dir) = dirs::home_dir() {
                return Ok(home_dir.join(stripped));
            }
        }
        return Ok(PathBuf::from(cache_dir));
    }

    dirs::cache_dir()
        .map(|dir| dir.join(default_subdir))
        .ok_or_else(|| anyhow!("Unable to determine cache directory"))
}

pub fn get_cache_dir() -> Result<PathBuf> {
    get_cache_dir_with_env_override(CACHE_DIR_ENV, "onnx-models")
}

/// Where compiled CoreML artifacts are kept
pub fn get_coreml_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|dir| dir.join("nandi").join("coreml"))
        .ok_or_else(|| anyhow!("Unable to determine CoreML cache directory"))
}

pub fn calculate_md5_bytes(bytes: &[u8]) -> String {
    let mut hasher = md5::Context::new();
    hasher.consume(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn calculate_md5(path: &Path) -> Result<String> {
    let contents = fs::read(path)?;
    Ok(calculate_md5_bytes(&contents))
}

pub fn verify_checksum(path: &Path, expected_md5: &str) -> Result<bool> {
    Ok(calculate_md5(path)?.eq_ignore_ascii_case(expected_md5.trim()))
}

/// Reject missing or empty model files before handing them to ONNX Runtime
pub fn validate_model_file(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)
        .map_err(|e| anyhow!("Model file {} is not readable: {e}", path.display()))?;
    if !metadata.is_file() {
        return Err(anyhow!("Model path is not a file: {}", path.display()));
    }
    if metadata.len() == 0 {
        return Err(anyhow!(
            "Model file is empty (0 bytes): {}",
            path.display()
        ));
    }
    log::debug!(
        "Model file size: {:.2} MB",
        metadata.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

/// Stream `url` into `output_path`, showing a progress bar
fn download_model(url: &str, output_path: &Path) -> Result<()> {
    log::info!("{}Downloading model from: {url}", symbols::download());

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let client = reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;
    let mut response = client
        .get(url)
        .send()
        .map_err(|e| anyhow!("Failed to send HTTP request: {e}"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("HTTP request failed with status: {status}"));
    }

    let content_length = response.content_length();
    let pb = create_download_bar(content_length);

    // Write to a sibling temp file so a partial download never looks cached
    let partial_path = output_path.with_extension("partial");
    let mut file = fs::File::create(&partial_path).map_err(|e| {
        anyhow!(
            "Failed to create output file {}: {e}",
            partial_path.display()
        )
    })?;

    let mut downloaded = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .map_err(|e| anyhow!("Failed to read response data: {e}"))?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;
        pb.set_position(downloaded);
    }
    file.flush()?;
    file.sync_all()?;
    drop(file);

    pb.finish_and_clear();
    remove_progress_bar(&pb);

    if downloaded == 0 {
        let _ = fs::remove_file(&partial_path);
        return Err(anyhow!("Downloaded file is empty (0 bytes)"));
    }
    if let Some(expected) = content_length {
        if downloaded != expected {
            log::warn!(
                "{}Size mismatch: expected {expected} bytes, got {downloaded} bytes",
                symbols::warning()
            );
        }
    }

    fs::rename(&partial_path, output_path)?;
    log::info!(
        "{}Model downloaded to: {}",
        symbols::completed_successfully(),
        output_path.display()
    );
    Ok(())
}

/// Download under a lock file so concurrent processes don't fetch the same model twice
fn download_with_lock(
    url: &str,
    model_path: &Path,
    lock_path: &Path,
    checksum: Option<&str>,
) -> Result<()> {
    const MAX_WAIT: Duration = Duration::from_secs(300);
    const MAX_INTERVAL: Duration = Duration::from_millis(1000);

    let start = Instant::now();
    let mut wait = Duration::from_millis(50);

    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }

    loop {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut lock_file) => {
                let _ = write!(lock_file, "locked by process {}", std::process::id());
                let result = download_model(url, model_path);
                let _ = fs::remove_file(lock_path);
                return result;
            }
            Err(_) => {
                let finished = match checksum {
                    Some(expected) => model_path.exists()
                        && verify_checksum(model_path, expected).unwrap_or(false),
                    None => fs::metadata(model_path)
                        .map(|m| m.len() > 0)
                        .unwrap_or(false),
                };
                if finished {
                    log::debug!("Model downloaded by another process, using cached version");
                    return Ok(());
                }

                if start.elapsed() > MAX_WAIT {
                    log::warn!(
                        "{}Download lock timeout ({}s), removing stale lock",
                        symbols::warning(),
                        MAX_WAIT.as_secs()
                    );
                    let _ = fs::remove_file(lock_path);
                    return download_model(url, model_path);
                }

                log::debug!(
                    "Waiting for concurrent download ({}s elapsed)",
                    start.elapsed().as_secs()
                );
                std::thread::sleep(wait);
                wait = (wait * 2).min(MAX_INTERVAL);
            }
        }
    }
}

/// Cache file name; the checksum is folded in so different versions don't collide
fn cache_file_name(filename: &str, checksum: Option<&str>) -> String {
    match checksum {
        Some(checksum) => match filename.rsplit_once('.') {
            Some((name, ext)) => format!("{name}-{checksum}.{ext}"),
            None => format!("{filename}-{checksum}"),
        },
        None => filename.to_string(),
    }
}

/// Return a cached model at `url`, downloading (and verifying) it when needed
pub fn get_or_download_model(url: &str, filename: &str, checksum: Option<&str>) -> Result<PathBuf> {
    let cache_dir = get_cache_dir()?;
    let name = cache_file_name(filename, checksum);
    let model_path = cache_dir.join(&name);
    let lock_path = cache_dir.join(format!("{name}.lock"));

    log::debug!("{}Model cache path: {}", symbols::checking(), model_path.display());

    if model_path.exists() {
        match checksum {
            Some(expected) => match verify_checksum(&model_path, expected) {
                Ok(true) => {
                    log::debug!("Using cached model: {}", model_path.display());
                    return Ok(model_path);
                }
                Ok(false) => {
                    log::warn!(
                        "{}Cached model has invalid checksum, re-downloading",
                        symbols::warning()
                    );
                    fs::remove_file(&model_path)?;
                }
                Err(e) => {
                    log::warn!(
                        "{}Error verifying cached model: {e}, re-downloading",
                        symbols::warning()
                    );
                    fs::remove_file(&model_path)?;
                }
            },
            None => {
                log::warn!(
                    "{}No checksum provided; cached model cannot be verified, re-downloading",
                    symbols::warning()
                );
                fs::remove_file(&model_path)?;
            }
        }
    }

    download_with_lock(url, &model_path, &lock_path, checksum)?;

    match checksum {
        Some(expected) => {
            let actual = calculate_md5(&model_path)?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                fs::remove_file(&model_path)?;
                return Err(anyhow!(
                    "Downloaded model failed checksum verification.\n\
                     Expected checksum: {expected}\n\
                     Actual checksum:   {actual}\n\
                     Model URL: {url}"
                ));
            }
            log::info!(
                "{}Model downloaded and verified",
                symbols::completed_successfully()
            );
        }
        None => log::warn!(
            "{}Model downloaded but no checksum provided to verify it",
            symbols::warning()
        ),
    }

    Ok(model_path)
}
