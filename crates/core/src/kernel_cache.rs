//! Process-wide memo of compiled kernels, keyed by structure.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::device::{Device, LaunchArg, LaunchConfig, LaunchableKernel};
use crate::template;
use crate::types::{Binding, BindingSet};

pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Binding the launcher adds to every template; used by `__launch_bounds__`.
pub const BLOCK_SIZE_BINDING: &str = "block_size";

/// `function|name=value|..@device`. Buffer contents never enter the key.
///
/// Separators inside any part are escaped with `\`, so distinct binding
/// sets never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(String);

const KEY_SEPARATORS: [char; 4] = ['\\', '|', '=', '@'];

fn push_escaped(key: &mut String, part: &str) {
    for ch in part.chars() {
        if KEY_SEPARATORS.contains(&ch) {
            key.push('\\');
        }
        key.push(ch);
    }
}

impl CacheKey {
    pub fn derive(function: &str, bindings: &BindingSet<'_>, device_identity: &str) -> Self {
        let mut key = String::new();
        push_escaped(&mut key, function);
        for (name, binding) in bindings.iter() {
            key.push('|');
            push_escaped(&mut key, name);
            key.push('=');
            push_escaped(&mut key, &binding.key_text());
        }
        key.push('@');
        push_escaped(&mut key, device_identity);
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A kernel compiled for one key; immutable once stored.
pub struct CompiledKernel {
    pub key: CacheKey,
    pub function_name: String,
    pub resolved_source: String,
    pub source_digest: String,
    pub device: String,
    program: Arc<dyn LaunchableKernel>,
}

impl CompiledKernel {
    pub fn launch(&self, config: LaunchConfig, args: &[LaunchArg<'_>]) -> Result<()> {
        self.program
            .launch(config, args)
            .with_context(|| format!("kernel `{}` failed on `{}`", self.function_name, self.device))
    }
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("key", &self.key)
            .field("function_name", &self.function_name)
            .field("source_digest", &self.source_digest)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
}

#[derive(Default)]
pub struct KernelCache {
    kernels: DashMap<CacheKey, Arc<CompiledKernel>>,
    gates: DashMap<CacheKey, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
}

static GLOBAL_CACHE: OnceLock<Arc<KernelCache>> = OnceLock::new();

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every operator built without an explicit one.
    pub fn global() -> Arc<KernelCache> {
        GLOBAL_CACHE
            .get_or_init(|| Arc::new(KernelCache::new()))
            .clone()
    }

    /// Return the kernel for this structure, compiling it on first use.
    ///
    /// Concurrent first callers for one key serialize on a per-key gate so
    /// the device compiles once. Failures are returned and not remembered.
    pub fn get_or_compile(
        &self,
        device: &dyn Device,
        function: &str,
        template: &str,
        bindings: &BindingSet<'_>,
    ) -> Result<Arc<CompiledKernel>> {
        let device_identity = device.identity();
        let key = CacheKey::derive(function, bindings, &device_identity);

        if let Some(kernel) = self.lookup(&key) {
            return Ok(kernel);
        }

        let gate = self.gates.entry(key.clone()).or_default().clone();
        let _guard = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(kernel) = self.lookup(&key) {
            return Ok(kernel);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let resolved_source = template::resolve(function, template, bindings)?;
        let program = device
            .compile(function, &resolved_source)
            .with_context(|| {
                format!("failed to compile kernel `{function}` for device `{device_identity}`")
            })?;
        self.compilations.fetch_add(1, Ordering::Relaxed);

        let source_digest = format!("{:x}", Sha256::digest(resolved_source.as_bytes()));
        info!(
            kernel = function,
            device = %device_identity,
            digest = &source_digest[..12],
            source_len = resolved_source.len(),
            "Compiled kernel"
        );

        let kernel = Arc::new(CompiledKernel {
            key: key.clone(),
            function_name: function.to_string(),
            resolved_source,
            source_digest,
            device: device_identity,
            program,
        });
        self.kernels.insert(key, Arc::clone(&kernel));
        Ok(kernel)
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<CompiledKernel>> {
        let kernel = self.kernels.get(key)?.value().clone();
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Kernel cache hit");
        Some(kernel)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CompiledKernel>> {
        self.kernels.get(key).map(|entry| entry.value().clone())
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.kernels.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.kernels.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
        }
    }
}

/// A device, a cache and a block size: everything needed to run a template
/// over `n` elements.
#[derive(Clone)]
pub struct KernelLauncher {
    device: Arc<dyn Device>,
    cache: Arc<KernelCache>,
    block_size: u32,
}

impl KernelLauncher {
    pub fn new(device: Arc<dyn Device>, cache: Arc<KernelCache>) -> Self {
        Self {
            device,
            cache,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn cache(&self) -> &Arc<KernelCache> {
        &self.cache
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Resolve and compile (or fetch) the kernel for `bindings`.
    pub fn prepare(
        &self,
        function: &str,
        template: &str,
        mut bindings: BindingSet<'_>,
    ) -> Result<Arc<CompiledKernel>> {
        bindings.bind(BLOCK_SIZE_BINDING, Binding::Int(i64::from(self.block_size)));
        self.cache
            .get_or_compile(self.device.as_ref(), function, template, &bindings)
    }

    /// Prepare the kernel, then launch one thread per element of `n`.
    pub fn launch(
        &self,
        function: &str,
        template: &str,
        bindings: BindingSet<'_>,
        n: usize,
        args: &[LaunchArg<'_>],
    ) -> Result<()> {
        if n > i32::MAX as usize {
            bail!("kernel `{function}`: {n} elements exceed the launch limit");
        }
        let kernel = self.prepare(function, template, bindings)?;
        if n == 0 {
            debug!(kernel = function, "Skipping launch over zero elements");
            return Ok(());
        }
        kernel.launch(LaunchConfig::for_elements(n, self.block_size), args)
    }
}

impl fmt::Debug for KernelLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLauncher")
            .field("device", &self.device.identity())
            .field("block_size", &self.block_size)
            .field("cache", &self.cache.stats())
            .finish()
    }
}
