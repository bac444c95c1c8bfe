//! Configuration loading.
//!
//! The schema lives in [`lm_core::config`]; this module finds the file,
//! applies `LINKMIRROR_*` environment overrides and validates the result.

pub use lm_core::config::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Locations searched when no `--config` is given, in order.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./linkmirror.toml",
    "~/.config/linkmirror/config.toml",
    "/etc/linkmirror/config.toml",
];

/// Parse, override and validate configuration text.
///
/// Returns the config together with any non-fatal warnings.
pub fn parse_config(contents: &str) -> lm_core::Result<(Config, Vec<String>)> {
    let mut config = Config::from_toml_str(contents)?;
    config.apply_env_overrides();
    let warnings = config.validate()?;
    Ok((config, warnings))
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let (config, warnings) = parse_config(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    for warning in warnings {
        tracing::warn!("Config warning: {warning}");
    }

    Ok(config)
}

/// The config file that would be used: the explicit path if given,
/// otherwise the first default location that exists.
pub fn locate_config(custom_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = custom_path {
        return Some(path.to_path_buf());
    }

    DEFAULT_CONFIG_PATHS
        .iter()
        .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
        .find(|p| p.exists())
}

/// Load config from the given or default locations, or build one from
/// defaults plus environment overrides.
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = locate_config(custom_path) {
        return load_config(&path);
    }

    tracing::debug!("No config file found, using defaults and environment");
    let mut config = Config::default();
    config.apply_env_overrides();
    let warnings = config
        .validate()
        .context("Default configuration is incomplete (set LINKMIRROR_SOURCE_ROOT and LINKMIRROR_TARGET_BASE or pass --config)")?;
    for warning in warnings {
        tracing::warn!("Config warning: {warning}");
    }
    Ok(config)
}
