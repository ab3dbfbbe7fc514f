//! Compiled kernel cache.
//!
//! Compiling a generated program is expensive, and every stencil of a given
//! element type runs the same program. Compiled kernels are therefore kept per
//! device context and shared by all stencils that use that context.
//!
//! The cache is an explicit object. [`KernelCache::shared`] is the process-wide
//! instance used by default; a stencil can be given its own cache through
//! [`crate::config::StencilConfig`], which keeps tests and independent
//! subsystems isolated from each other.

use crate::codegen::KernelProgram;
use crate::device::{ContextId, Device, DeviceError, Result, StencilElem};
use log::debug;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Which program a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelVariant {
    /// The generic coefficient convolution.
    Generic,
    /// The tiled coefficient convolution.
    Tiled,
    /// A user operator, identified by its type.
    Operator(TypeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct KernelKey {
    context: ContextId,
    device: TypeId,
    element: TypeId,
    variant: KernelVariant,
}

/// A compiled kernel with its launch parameters.
pub struct KernelEntry<T: StencilElem, D: Device> {
    pub kernel: D::Kernel<T>,
    /// Workgroup size used for every launch of this kernel.
    pub workgroup_size: usize,
    pub name: String,
    pub source: String,
}

impl<T: StencilElem, D: Device> KernelEntry<T, D> {
    /// Compiles `program` on `device`.
    pub fn compile(device: &D, program: &KernelProgram<T>, workgroup_size: usize) -> Result<Self> {
        Ok(Self {
            kernel: device.compile(program)?,
            workgroup_size,
            name: program.name.clone(),
            source: program.source.clone(),
        })
    }
}

type Slot = Arc<dyn Any + Send + Sync>;

/// Kernels memoised by `(context, device type, element type, variant)`.
#[derive(Default)]
pub struct KernelCache {
    entries: Mutex<HashMap<KernelKey, Slot>>,
    compiles: AtomicUsize,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn shared() -> Arc<KernelCache> {
        static SHARED: OnceLock<Arc<KernelCache>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(KernelCache::new())))
    }

    /// Number of cached kernels.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of kernels compiled through this cache so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Returns the entry for `variant` in the context of `device`, compiling
    /// it with `build` on first use.
    ///
    /// The cache lock is held while `build` runs, so concurrent first uses
    /// of the same key compile once.
    pub fn get_or_compile<T, D, F>(
        &self,
        device: &D,
        variant: KernelVariant,
        build: F,
    ) -> Result<Arc<KernelEntry<T, D>>>
    where
        T: StencilElem,
        D: Device,
        F: FnOnce() -> Result<KernelEntry<T, D>>,
    {
        let key = KernelKey {
            context: device.context(),
            device: TypeId::of::<D>(),
            element: TypeId::of::<T>(),
            variant,
        };

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DeviceError::Poisoned("kernel cache"))?;

        if let Some(slot) = entries.get(&key) {
            return Arc::clone(slot)
                .downcast::<KernelEntry<T, D>>()
                .map_err(|_| DeviceError::Compile {
                    kernel: format!("{:?}", variant),
                    reason: "cache entry has an unexpected type".to_string(),
                });
        }

        debug!(
            "Kernel cache miss for {:?} ({}) in context {} of {}",
            variant,
            T::TYPE_NAME,
            key.context.raw(),
            device.name()
        );
        let entry = Arc::new(build()?);
        self.compiles.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, Arc::clone(&entry) as Slot);
        Ok(entry)
    }
}

impl std::fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCache")
            .field("entries", &self.len())
            .field("compiles", &self.compile_count())
            .finish()
    }
}
