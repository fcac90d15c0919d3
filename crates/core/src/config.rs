use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::compositor::{Compositor, HOLE_THRESHOLD, METRIC_CLIP};
use crate::device::Device;
use crate::kernel_cache::{KernelCache, KernelLauncher, DEFAULT_BLOCK_SIZE};
use crate::splat::{SoftSplat, DEFAULT_EPSILON};
use crate::warp::BackWarp;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "FLOWSPLAT_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SplatConfig {
    pub toolchain: ToolchainConfig,
    pub launch: LaunchSettings,
    pub normalize: NormalizeConfig,
    pub compositor: CompositorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Accelerator SDK root; falls back to `CUDA_HOME`, then `/usr/local/cuda/`.
    pub cuda_home: Option<PathBuf>,
    pub extra_include_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchSettings {
    pub block_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizeConfig {
    pub epsilon: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompositorConfig {
    pub hole_threshold: f32,
    pub metric_clip: f32,
}

impl ToolchainConfig {
    /// Relative SDK paths in a config file are relative to that file.
    pub fn resolve_paths(&mut self, base: &Path) {
        if let Some(home) = self.cuda_home.as_mut() {
            *home = resolve_relative_to(base, home);
        }
        for dir in &mut self.extra_include_dirs {
            *dir = resolve_relative_to(base, dir);
        }
    }
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            hole_threshold: HOLE_THRESHOLD,
            metric_clip: METRIC_CLIP,
        }
    }
}

impl SplatConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.toolchain.resolve_paths(base);
        }
        Ok(config)
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

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.launch.block_size > 0 && self.launch.block_size <= 1024,
            "launch.block_size must be in 1..=1024, got {}",
            self.launch.block_size
        );
        ensure!(
            self.normalize.epsilon > 0.0,
            "normalize.epsilon must be positive, got {}",
            self.normalize.epsilon
        );
        ensure!(
            self.compositor.hole_threshold > 0.0,
            "compositor.hole_threshold must be positive, got {}",
            self.compositor.hole_threshold
        );
        ensure!(
            self.compositor.metric_clip > 0.0,
            "compositor.metric_clip must be positive, got {}",
            self.compositor.metric_clip
        );
        Ok(())
    }

    pub fn launcher(&self, device: Arc<dyn Device>, cache: Arc<KernelCache>) -> KernelLauncher {
        KernelLauncher::new(device, cache).with_block_size(self.launch.block_size)
    }

    pub fn soft_splat(&self, launcher: KernelLauncher) -> SoftSplat {
        SoftSplat::new(launcher).with_epsilon(self.normalize.epsilon)
    }

    pub fn compositor(&self, launcher: KernelLauncher) -> Compositor {
        Compositor::new(self.soft_splat(launcher))
            .with_hole_threshold(self.compositor.hole_threshold)
            .with_metric_clip(self.compositor.metric_clip)
    }

    pub fn back_warp(&self, launcher: KernelLauncher) -> BackWarp {
        BackWarp::new(launcher)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. FLOWSPLAT_DATA_DIR environment variable
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

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
/// An existing config is left untouched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        SplatConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` unchanged if absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
