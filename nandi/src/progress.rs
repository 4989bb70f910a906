//! Shared progress display.
//!
//! A process-wide `MultiProgress` lets the model downloader and the CLI stage
//! spinner draw without stepping on each other.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use std::io::{stderr, IsTerminal};
use std::sync::Arc;
use std::time::Duration;

use crate::color_utils::colors_enabled;

static MULTI: Lazy<Arc<MultiProgress>> = Lazy::new(|| Arc::new(MultiProgress::new()));

pub fn global_mp() -> Arc<MultiProgress> {
    MULTI.clone()
}

pub fn add_progress_bar(pb: ProgressBar) -> ProgressBar {
    global_mp().add(pb)
}

pub fn remove_progress_bar(pb: &ProgressBar) {
    global_mp().remove(pb);
}

/// Spinner showing the current pipeline stage. `None` when stderr is not interactive.
pub fn create_stage_spinner() -> Option<ProgressBar> {
    if !stderr().is_terminal() {
        return None;
    }

    let pb = add_progress_bar(ProgressBar::new_spinner());
    let template = if colors_enabled() {
        "{spinner:.green} [{elapsed_precise}] {msg}"
    } else {
        "{spinner} [{elapsed_precise}] {msg}"
    };
    if let Ok(style) = ProgressStyle::default_spinner().template(template) {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// Byte-count bar for downloads, or a spinner when the size is unknown
pub fn create_download_bar(content_length: Option<u64>) -> ProgressBar {
    match content_length {
        Some(length) => {
            let pb = add_progress_bar(ProgressBar::new(length));
            if let Ok(style) = ProgressStyle::default_bar()
                .template(
                    "[{elapsed_precise}] [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
                )
                .map(|s| s.progress_chars("#> "))
            {
                pb.set_style(style);
            }
            pb.set_message("Downloading model");
            pb
        }
        None => {
            let pb = add_progress_bar(ProgressBar::new_spinner());
            pb.set_message("Downloading model (unknown size)...");
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
