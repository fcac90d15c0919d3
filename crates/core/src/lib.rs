//! Core crate: kernel templates, the compilation cache and the splatting
//! operators built on them.

pub mod compositor;
pub mod config;
pub mod device;
pub mod gradcheck;
pub mod host;
pub mod kernel_cache;
pub mod kernels;
pub mod logging;
pub mod splat;
pub mod template;
pub mod toolchain;
pub mod types;
pub mod warp;

pub use compositor::{Composite, Compositor, DirectionalSplat};
pub use kernel_cache::{KernelCache, KernelLauncher};
pub use splat::{EpsilonPolicy, GradRequest, SoftSplat, SplatMode};
pub use types::{Binding, BindingSet, DType, TensorDescriptor};
