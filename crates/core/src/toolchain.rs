//! Locating the accelerator SDK that an external compiler backend needs.
//!
//! The host device compiles nothing, but a CUDA-backed [`crate::device::Device`]
//! has to hand the runtime compiler the SDK headers. Resolution order for the
//! SDK root:
//!   1. `[toolchain].cuda_home` from `config.toml`
//!   2. `CUDA_HOME` environment variable
//!   3. `/usr/local/cuda/`

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::ToolchainConfig;

const ENV_CUDA_HOME: &str = "CUDA_HOME";
const DEFAULT_CUDA_HOME: &str = "/usr/local/cuda/";

#[cfg(unix)]
const COMPILER_NAME: &str = "nvcc";
#[cfg(windows)]
const COMPILER_NAME: &str = "nvcc.exe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    cuda_home: PathBuf,
    include_dirs: Vec<PathBuf>,
}

impl Toolchain {
    pub fn resolve(config: &ToolchainConfig) -> Self {
        Self::resolve_with_env(config, env::var_os(ENV_CUDA_HOME))
    }

    fn resolve_with_env(config: &ToolchainConfig, env_home: Option<OsString>) -> Self {
        let cuda_home = config
            .cuda_home
            .clone()
            .or_else(|| env_home.filter(|v| !v.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CUDA_HOME));

        let mut include_dirs = Vec::new();
        let candidates = [cuda_home.clone(), cuda_home.join("include")]
            .into_iter()
            .chain(config.extra_include_dirs.iter().cloned());
        for dir in candidates {
            if !include_dirs.contains(&dir) {
                include_dirs.push(dir);
            }
        }

        Self {
            cuda_home,
            include_dirs,
        }
    }

    pub fn cuda_home(&self) -> &Path {
        &self.cuda_home
    }

    pub fn include_dirs(&self) -> &[PathBuf] {
        &self.include_dirs
    }

    /// Options for the runtime compiler, one `-I <dir>` pair per include dir.
    pub fn compile_options(&self) -> Vec<String> {
        self.include_dirs
            .iter()
            .flat_map(|dir| ["-I".to_string(), dir.display().to_string()])
            .collect()
    }

    pub fn compiler_path(&self) -> Option<PathBuf> {
        let candidate = self.cuda_home.join("bin").join(COMPILER_NAME);
        candidate.is_file().then_some(candidate)
    }

    /// Compiler followed by [`Self::compile_options`]. Falls back to the bare
    /// compiler name when no binary exists under the SDK root.
    pub fn compile_command(&self) -> Vec<String> {
        let compiler = self
            .compiler_path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| COMPILER_NAME.to_string());
        std::iter::once(compiler)
            .chain(self.compile_options())
            .collect()
    }
}

/// Log which toolchain paths were resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_toolchain_status(toolchain: &Toolchain) {
    if toolchain.cuda_home.is_dir() {
        info!("CUDA home: {}", toolchain.cuda_home.display());
    } else {
        warn!(
            "CUDA home {} not found; only the host device is usable",
            toolchain.cuda_home.display()
        );
    }

    for dir in toolchain.include_dirs.iter().skip(2) {
        if !dir.is_dir() {
            warn!("extra include dir {} does not exist", dir.display());
        }
    }

    match toolchain.compiler_path() {
        Some(path) => info!("CUDA compiler: {}", path.display()),
        None => info!("CUDA compiler not found under {}", toolchain.cuda_home.display()),
    }
}
