use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::types::TensorDescriptor;

/// Grid and block sizing for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: u32,
    pub block: u32,
}

impl LaunchConfig {
    /// One thread per element, rounded up to whole blocks.
    pub fn for_elements(n: usize, block: u32) -> Self {
        let block = block.max(1);
        let grid = n.div_ceil(block as usize) as u32;
        Self { grid, block }
    }

    pub fn total_threads(&self) -> usize {
        self.grid as usize * self.block as usize
    }
}

/// One positional kernel argument.
#[derive(Debug, Clone)]
pub enum LaunchArg<'buf> {
    Int(i64),
    Float(f64),
    Tensor(TensorDescriptor<'buf>),
    /// An optional buffer the kernel was resolved without.
    Null,
}

impl<'buf> LaunchArg<'buf> {
    pub fn tensor(&self) -> Option<&TensorDescriptor<'buf>> {
        match self {
            Self::Tensor(desc) => Some(desc),
            _ => None,
        }
    }
}

/// A compiled device function.
pub trait LaunchableKernel: Send + Sync {
    /// Run the kernel and block until it finishes.
    fn launch(&self, config: LaunchConfig, args: &[LaunchArg<'_>]) -> Result<()>;
}

/// An accelerator plus its toolchain.
pub trait Device: Send + Sync {
    /// Stable name of the physical device; part of every cache key.
    fn identity(&self) -> String;

    /// Compile a fully resolved source into a launchable entry point named
    /// `function`.
    fn compile(&self, function: &str, source: &str) -> Result<Arc<dyn LaunchableKernel>>;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("identity", &self.identity())
            .finish()
    }
}
