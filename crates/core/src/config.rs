use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::decoder::DecodeColorspace;
use crate::gpu::UpsampleFilter;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "NSS_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NssConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

/// Which inference backend compiles the network.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
    /// Built-in temporal average; needs no model artifact.
    Reference,
}

impl BackendKind {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            "reference" | "ref" => Self::Reference,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
            Self::Reference => write!(f, "reference"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: BackendKind,
    pub device_id: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Wait for every frame inside `process_with_queue`.
    pub sync_mode: bool,
    pub upsample_filter: UpsampleFilter,
    pub decode_colorspace: DecodeColorspace,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl NssConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Models directory, resolved against `data_dir` when relative.
    pub fn models_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.models_dir)
    }

    pub fn trt_cache_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.trt_cache_dir)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. NSS_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        NssConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
