//! Driver parameters: delayed-close watermarks, the per-volume worker
//! threshold, and feature flags. Loaded once before mount from a YAML file
//! and treated as read-only afterwards, except for the explicit
//! [`DriverParams::update_from`] re-read path.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Tunables supplied by the host at mount time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DriverParams {
    /// High watermark for the file delayed-close queue.
    pub max_delayed_close: usize,
    /// Low watermark the drain task reduces the file queue to.
    pub min_delayed_close: usize,
    /// High watermark for the directory delayed-close queue.
    pub max_dir_delayed_close: usize,
    /// Low watermark for the directory queue.
    pub min_dir_delayed_close: usize,
    /// Worker tasks allowed to service one volume concurrently; requests
    /// beyond this spill into the overflow queue.
    pub posted_request_threshold: u32,
    /// Inline dispatch nesting allowed before a request is handed off to a
    /// worker to protect the caller's stack budget.
    pub inline_depth_limit: u32,
    pub features: Features,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Features {
    pub read_only: bool,
    pub no_delayed_close: bool,
    /// Fall back to a raw mount when structural validation fails but the
    /// medium is readable.
    pub allow_raw_mount: bool,
    pub removable: bool,
}

impl Default for DriverParams {
    fn default() -> Self {
        // The medium-memory profile; hosts with more to spare raise the
        // watermarks through the config file.
        Self {
            max_delayed_close: 24,
            min_delayed_close: 6,
            max_dir_delayed_close: 8,
            min_dir_delayed_close: 2,
            posted_request_threshold: 2,
            inline_depth_limit: 8,
            features: Features::default(),
        }
    }
}

impl DriverParams {
    /// Explicit re-read of the parameter file. This is the only sanctioned
    /// way to change parameters after mount.
    pub fn update_from(&mut self, path: impl AsRef<Path>) -> Result<()> {
        *self = load_params(path)?;
        Ok(())
    }
}

/// Load parameters from a YAML file, falling back to defaults for missing
/// fields.
pub fn load_params(path: impl AsRef<Path>) -> Result<DriverParams> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read driver params from {}", path.display()))?;
    let params: DriverParams =
        serde_yaml::from_str(&content).context("Failed to parse YAML driver params")?;
    Ok(params)
}
