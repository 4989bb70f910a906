//! Conditional colored output for log lines and CLI messages.
//!
//! Colors are disabled by any of:
//! - the `--no-color` flag
//! - `NO_COLOR` (https://no-color.org/) or `NANDI_NO_COLOR`
//! - `TERM=dumb`
//! - stderr not being a TTY

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

fn should_disable_colors_from_env() -> bool {
    !std::env::var("NO_COLOR").unwrap_or_default().is_empty()
        || !std::env::var("NANDI_NO_COLOR").unwrap_or_default().is_empty()
        || std::env::var("TERM").unwrap_or_default() == "dumb"
        || !stderr().is_terminal()
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        Self {
            colors_enabled: !no_color_flag && !should_disable_colors_from_env(),
        }
    }
}

/// Fix the color decision for the rest of the process. Call once after parsing CLI args.
pub fn init_color_config(no_color_flag: bool) {
    if COLOR_CONFIG.set(ColorConfig::new(no_color_flag)).is_err() {
        log::debug!("Color configuration already initialized");
    }
}

pub fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.colors_enabled)
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

/// Apply `color_fn` only when colors are enabled
pub fn maybe_color<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

pub fn maybe_dim(text: &str) -> String {
    use colored::Colorize;
    maybe_color(text, |s| s.bright_black())
}

pub mod colors {
    use super::maybe_color;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color(text, |s| s.red().bold())
    }

    pub fn warning_level(text: &str) -> String {
        maybe_color(text, |s| s.yellow())
    }

    pub fn info_level(text: &str) -> String {
        maybe_color(text, |s| s.green())
    }

    pub fn debug_level(text: &str) -> String {
        maybe_color(text, |s| s.blue())
    }

    pub fn trace_level(text: &str) -> String {
        maybe_color(text, |s| s.magenta())
    }

    /// Highlight for labels such as a breed name in CLI output
    pub fn emphasis(text: &str) -> String {
        maybe_color(text, |s| s.cyan().bold())
    }
}

/// Message prefixes. Emoji when colors are on, plain tags otherwise.
pub mod symbols {
    use super::colors_enabled;

    fn pick(fancy: &'static str, plain: &'static str) -> &'static str {
        if colors_enabled() {
            fancy
        } else {
            plain
        }
    }

    pub fn model_loaded() -> &'static str {
        pick("✅ ", "")
    }

    pub fn checking() -> &'static str {
        pick("🔍 ", "")
    }

    pub fn analysis_start() -> &'static str {
        pick("🐄 ", "")
    }

    pub fn download() -> &'static str {
        pick("📥 ", "")
    }

    pub fn system_setup() -> &'static str {
        pick("⚙️  ", "")
    }

    pub fn operation_failed() -> &'static str {
        pick("❌ ", "[FAILED] ")
    }

    pub fn completed_successfully() -> &'static str {
        pick("✅ ", "[SUCCESS] ")
    }

    pub fn warning() -> &'static str {
        pick("⚠️  ", "")
    }
}
