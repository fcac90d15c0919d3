//! CPU implementation of [`Device`].
//!
//! Compiling on the host checks that the resolved source is complete and
//! binds the entry point to a native function from a [`HostKernelRegistry`].
//! Launches fan out over rayon; one index per device thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use rayon::prelude::*;
use tracing::trace;

use crate::device::{Device, LaunchArg, LaunchConfig, LaunchableKernel};
use crate::template::KernelTemplate;
use crate::types::{DType, TensorDescriptor};

type HostEntry = dyn Fn(&HostLaunch<'_, '_>) -> Result<()> + Send + Sync;

pub struct HostKernelRegistry {
    entries: HashMap<String, Arc<HostEntry>>,
}

impl HostKernelRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registry holding every kernel this crate ships.
    pub fn with_builtin_kernels() -> Self {
        let mut registry = Self::new();
        crate::kernels::register_host_kernels(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, function: &str, entry: F)
    where
        F: Fn(&HostLaunch<'_, '_>) -> Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(function.to_string(), Arc::new(entry));
    }

    fn entry(&self, function: &str) -> Result<Arc<HostEntry>> {
        self.entries
            .get(function)
            .cloned()
            .ok_or_else(|| anyhow!("no host implementation for kernel `{function}`"))
    }

    pub fn list_kernels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(|v| v.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HostKernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HostDevice {
    identity: String,
    registry: Arc<HostKernelRegistry>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            identity: format!("host:{}", std::env::consts::ARCH),
            registry: Arc::new(HostKernelRegistry::with_builtin_kernels()),
        }
    }

    /// Same kernels under another device name.
    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.to_string();
        self
    }

    pub fn with_registry(mut self, registry: HostKernelRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn compile(&self, function: &str, source: &str) -> Result<Arc<dyn LaunchableKernel>> {
        let leftovers = KernelTemplate::parse(function, source)?.unresolved();
        if !leftovers.is_empty() {
            bail!(
                "source for `{function}` is not fully resolved: {}",
                leftovers.join(", ")
            );
        }
        if !source.contains("extern \"C\"") {
            bail!("source for `{function}` has no extern \"C\" entry point");
        }
        if !source.contains(&format!("{function}(")) {
            bail!("source does not define `{function}`");
        }

        let entry = self.registry.entry(function)?;
        Ok(Arc::new(HostKernel {
            function: function.to_string(),
            entry,
        }))
    }
}

struct HostKernel {
    function: String,
    entry: Arc<HostEntry>,
}

impl LaunchableKernel for HostKernel {
    fn launch(&self, config: LaunchConfig, args: &[LaunchArg<'_>]) -> Result<()> {
        trace!(kernel = %self.function, grid = config.grid, block = config.block, "Host launch");
        (self.entry)(&HostLaunch {
            function: &self.function,
            config,
            args,
        })
    }
}

/// Arguments of one host launch with typed accessors.
pub struct HostLaunch<'a, 'buf> {
    function: &'a str,
    config: LaunchConfig,
    args: &'a [LaunchArg<'buf>],
}

impl HostLaunch<'_, '_> {
    pub fn config(&self) -> LaunchConfig {
        self.config
    }

    fn arg(&self, index: usize, name: &str) -> Result<&LaunchArg<'_>> {
        self.args.get(index).ok_or_else(|| {
            anyhow!(
                "kernel `{}`: missing argument {index} (`{name}`)",
                self.function
            )
        })
    }

    pub fn int(&self, index: usize, name: &str) -> Result<i64> {
        match self.arg(index, name)? {
            LaunchArg::Int(value) => Ok(*value),
            other => bail!(
                "kernel `{}`: argument `{name}` must be an int, got {other:?}",
                self.function
            ),
        }
    }

    /// Element count argument; must not exceed the launched thread count.
    pub fn count(&self, index: usize) -> Result<usize> {
        let n = self.int(index, "n")?;
        let n = usize::try_from(n)
            .map_err(|_| anyhow!("kernel `{}`: negative element count {n}", self.function))?;
        if n > self.config.total_threads() {
            bail!(
                "kernel `{}`: {n} elements but only {} threads launched",
                self.function,
                self.config.total_threads()
            );
        }
        Ok(n)
    }

    pub fn tensor(&self, index: usize, name: &str) -> Result<HostTensor> {
        match self.arg(index, name)? {
            LaunchArg::Tensor(desc) => HostTensor::new(self.function, name, desc),
            other => bail!(
                "kernel `{}`: argument `{name}` must be a tensor, got {other:?}",
                self.function
            ),
        }
    }

    /// Fail unless `tensor` is exactly `expected`; kernels index every
    /// binding with coordinates taken from one domain tensor.
    pub fn ensure_shape(&self, name: &str, tensor: &HostTensor, expected: [usize; 4]) -> Result<()> {
        if tensor.shape != expected {
            bail!(
                "kernel `{}`: `{name}` has shape {:?}, expected {:?}",
                self.function,
                tensor.shape,
                expected
            );
        }
        Ok(())
    }

    /// Fail when `n` indices would run past the domain tensor.
    pub fn ensure_domain(&self, n: usize, name: &str, domain: &HostTensor) -> Result<()> {
        if n > domain.len() {
            bail!(
                "kernel `{}`: {n} elements requested but `{name}` holds {}",
                self.function,
                domain.len()
            );
        }
        Ok(())
    }

    pub fn tensor_mut(&self, index: usize, name: &str) -> Result<HostTensor> {
        let tensor = self.tensor(index, name)?;
        if !tensor.writable {
            bail!(
                "kernel `{}`: output `{name}` was passed read-only",
                self.function
            );
        }
        Ok(tensor)
    }

    /// Run `body` once per index in `0..n`, partitioned into runs of at
    /// least one block.
    pub fn for_each_index<F>(&self, n: usize, body: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        (0..n)
            .into_par_iter()
            .with_min_len(self.config.block.max(1) as usize)
            .for_each(body);
    }
}

/// Raw float32 `[N, C, H, W]` view used by host kernels.
///
/// Built only from descriptors that borrow their buffer for the whole launch,
/// so every in-range index addresses live memory. Element access stays inside
/// the crate, behind entries that check shapes with
/// [`HostLaunch::ensure_shape`] before touching any element.
#[derive(Debug, Clone, Copy)]
pub struct HostTensor {
    ptr: usize,
    shape: [usize; 4],
    strides: [isize; 4],
    writable: bool,
}

impl HostTensor {
    fn new(function: &str, name: &str, desc: &TensorDescriptor<'_>) -> Result<Self> {
        if desc.dtype() != DType::F32 {
            bail!(
                "kernel `{function}`: host kernels need float32 `{name}`, got {}",
                desc.dtype()
            );
        }
        if desc.rank() != 4 || desc.strides().len() != 4 {
            bail!(
                "kernel `{function}`: `{name}` must be rank 4, got shape {:?}",
                desc.shape()
            );
        }
        if !desc.has_buffer() {
            bail!("kernel `{function}`: `{name}` has no buffer");
        }
        let shape = desc.shape();
        let strides = desc.strides();
        Ok(Self {
            ptr: desc.device_ptr(),
            shape: [shape[0], shape[1], shape[2], shape[3]],
            strides: [strides[0], strides[1], strides[2], strides[3]],
            writable: desc.is_writable(),
        })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn channels(&self) -> usize {
        self.shape[1]
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }

    pub fn width(&self) -> usize {
        self.shape[3]
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decompose a flat row-major index into `[n, c, y, x]`.
    pub fn unravel(&self, index: usize) -> [usize; 4] {
        let [_, c, h, w] = self.shape;
        let x = index % w;
        let y = (index / w) % h;
        let ch = (index / w / h) % c;
        let n = index / w / h / c;
        [n, ch, y, x]
    }

    fn element(&self, n: usize, c: usize, y: usize, x: usize) -> *mut f32 {
        debug_assert!(n < self.shape[0] && c < self.shape[1] && y < self.shape[2] && x < self.shape[3]);
        let offset = n as isize * self.strides[0]
            + c as isize * self.strides[1]
            + y as isize * self.strides[2]
            + x as isize * self.strides[3];
        (self.ptr as *mut f32).wrapping_offset(offset)
    }

    pub(crate) fn get(&self, n: usize, c: usize, y: usize, x: usize) -> f32 {
        // SAFETY: in-range indices address the borrowed buffer.
        unsafe { self.element(n, c, y, x).read() }
    }

    /// Plain store; callers write disjoint cells.
    pub(crate) fn set(&self, n: usize, c: usize, y: usize, x: usize, value: f32) {
        debug_assert!(self.writable);
        // SAFETY: in-range, writable, and no other thread touches this cell.
        unsafe { self.element(n, c, y, x).write(value) }
    }

    /// Order-independent accumulate for cells shared between threads.
    pub(crate) fn atomic_add(&self, n: usize, c: usize, y: usize, x: usize, value: f32) {
        debug_assert!(self.writable);
        // SAFETY: f32 and AtomicU32 share size and alignment, and during a
        // scatter every access to the output goes through this atomic.
        let cell = unsafe { AtomicU32::from_ptr(self.element(n, c, y, x).cast::<u32>()) };
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_cache::KernelCache;
    use crate::types::BindingSet;
    use ndarray::Array4;

    const FILL_SOURCE: &str = "extern \"C\" __global__ void fill(const int n, float* out) {}";

    fn fill_registry() -> HostKernelRegistry {
        let mut registry = HostKernelRegistry::new();
        registry.register("fill", |launch| {
            let n = launch.count(0)?;
            let out = launch.tensor_mut(1, "out")?;
            launch.ensure_domain(n, "out", &out)?;
            launch.for_each_index(n, |index| {
                let [b, c, y, x] = out.unravel(index);
                out.set(b, c, y, x, index as f32);
            });
            Ok(())
        });
        registry.register("accumulate", |launch| {
            let n = launch.count(0)?;
            let out = launch.tensor_mut(1, "out")?;
            launch.for_each_index(n, |_| out.atomic_add(0, 0, 0, 0, 1.0));
            Ok(())
        });
        registry
    }

    #[test]
    fn test_builtin_registry_lists_kernels() {
        let registry = HostKernelRegistry::with_builtin_kernels();
        assert_eq!(
            registry.list_kernels(),
            vec![
                "backwarp_out",
                "softsplat_flowgrad",
                "softsplat_ingrad",
                "softsplat_out"
            ]
        );
    }

    #[test]
    fn test_identity_defaults_to_host_arch() {
        let device = HostDevice::new();
        assert!(device.identity().starts_with("host:"));
        assert_eq!(device.with_identity("host:1").identity(), "host:1");
    }

    #[test]
    fn test_compile_rejects_unresolved_source() {
        let device = HostDevice::new().with_registry(fill_registry());
        let err = device
            .compile("fill", "extern \"C\" void fill(int n, {{type}}* out) { SIZE_0(out); }")
            .err()
            .expect("unresolved source should fail");
        let message = err.to_string();
        assert!(message.contains("{{type}}"), "{message}");
        assert!(message.contains("SIZE_0"), "{message}");
    }

    #[test]
    fn test_compile_rejects_missing_entry_point() {
        let device = HostDevice::new().with_registry(fill_registry());
        assert!(device.compile("fill", "__global__ void fill(int n) {}").is_err());
        assert!(device
            .compile("fill", "extern \"C\" __global__ void other(int n) {}")
            .is_err());
        let err = device
            .compile("missing", "extern \"C\" void missing() {}")
            .err()
            .expect("unknown kernel");
        assert!(err.to_string().contains("no host implementation"));
    }

    #[test]
    fn test_host_launch_writes_through_strided_view() {
        let device = HostDevice::new().with_registry(fill_registry());
        let kernel = device.compile("fill", FILL_SOURCE).expect("compile");

        let mut buffer = Array4::<f32>::zeros((1, 2, 2, 3));
        {
            let mut view = buffer.slice_mut(ndarray::s![.., .., .., ..;2]);
            let desc = TensorDescriptor::of_mut(&mut view);
            kernel
                .launch(
                    LaunchConfig::for_elements(8, 3),
                    &[LaunchArg::Int(8), LaunchArg::Tensor(desc)],
                )
                .expect("launch");
        }
        assert_eq!(buffer[[0, 0, 0, 0]], 0.0);
        assert_eq!(buffer[[0, 0, 0, 2]], 1.0);
        assert_eq!(buffer[[0, 0, 0, 1]], 0.0);
        assert_eq!(buffer[[0, 1, 1, 2]], 7.0);
    }

    #[test]
    fn test_atomic_add_counts_every_thread() {
        let device = HostDevice::new().with_registry(fill_registry());
        let kernel = device
            .compile("accumulate", "extern \"C\" void accumulate(int n, float* out) {}")
            .expect("compile");
        let mut out = Array4::<f32>::zeros((1, 1, 1, 1));
        kernel
            .launch(
                LaunchConfig::for_elements(1000, 7),
                &[LaunchArg::Int(1000), LaunchArg::Tensor(TensorDescriptor::of_mut(&mut out))],
            )
            .expect("launch");
        assert_eq!(out[[0, 0, 0, 0]], 1000.0);
    }

    #[test]
    fn test_launch_rejects_bad_arguments() {
        let device = HostDevice::new().with_registry(fill_registry());
        let kernel = device.compile("fill", FILL_SOURCE).expect("compile");
        let out = Array4::<f32>::zeros((1, 1, 2, 2));
        let doubles = Array4::<f64>::zeros((1, 1, 2, 2));

        let read_only = kernel.launch(
            LaunchConfig::for_elements(4, 512),
            &[LaunchArg::Int(4), LaunchArg::Tensor(TensorDescriptor::of(&out))],
        );
        assert!(read_only.is_err());

        let wrong_dtype = kernel.launch(
            LaunchConfig::for_elements(4, 512),
            &[LaunchArg::Int(4), LaunchArg::Tensor(TensorDescriptor::of(&doubles))],
        );
        assert!(format!("{:#}", wrong_dtype.expect_err("f64")).contains("float32"));

        let layout = TensorDescriptor::layout_only(DType::F32, &[1, 1, 2, 2], &[4, 4, 2, 1]);
        assert!(kernel
            .launch(
                LaunchConfig::for_elements(4, 512),
                &[LaunchArg::Int(4), LaunchArg::Tensor(layout)],
            )
            .is_err());

        let mut small = Array4::<f32>::zeros((1, 1, 1, 2));
        let past_the_end = kernel.launch(
            LaunchConfig::for_elements(4, 512),
            &[LaunchArg::Int(4), LaunchArg::Tensor(TensorDescriptor::of_mut(&mut small))],
        );
        let message = format!("{:#}", past_the_end.expect_err("n exceeds buffer"));
        assert!(message.contains("`out` holds 2"), "{message}");

        let too_few_threads = kernel.launch(
            LaunchConfig { grid: 1, block: 2 },
            &[LaunchArg::Int(4), LaunchArg::Null],
        );
        assert!(too_few_threads.is_err());
    }

    #[test]
    fn test_host_device_through_cache() {
        let cache = KernelCache::new();
        let device = HostDevice::new().with_registry(fill_registry());
        let template = "extern \"C\" __global__ void fill(const int n, {{type}}* out) {}";
        let out = Array4::<f32>::zeros((1, 1, 1, 1));
        let bindings = BindingSet::new().with_tensor("out", TensorDescriptor::of(&out));
        let kernel = cache
            .get_or_compile(&device, "fill", template, &bindings)
            .expect("compile");
        assert!(kernel.resolved_source.contains("float* out"));
    }
}
