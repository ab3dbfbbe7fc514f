//! Compute devices.
//!
//! A stencil drives one partition of its vectors per device. This module
//! defines what the engine needs from a device and the in-process
//! [`HostDevice`] implementation.
//!
//! # Execution model
//!
//! Every device owns an in-order command queue. Buffer reads, buffer writes
//! and kernel launches are *enqueued* and return immediately; [`Device::finish`]
//! blocks until everything enqueued so far has completed. Two devices never
//! wait on each other unless the caller puts a barrier in between, which is
//! exactly what halo exchange does.
//!
//! Kernels are generated as source (see [`crate::codegen`]) and compiled per
//! device context. Devices created in the same context can share compiled
//! kernels through the [`crate::cache::KernelCache`].

use crate::codegen::{KernelProgram, ParamKind};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use stencil_rs_kernels::{KernelElem, KernelError};
use thiserror::Error;

pub mod buffer;
pub mod host;

pub use buffer::{Buffer, PendingRead};
pub use host::{HostDevice, HostDeviceConfig, HostKernel};

/// Error type for device operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A buffer allocation exceeded what the device can provide.
    #[error("Allocation of {bytes} bytes on {device} exceeds the {limit} byte limit")]
    OutOfMemory {
        device: String,
        bytes: usize,
        limit: usize,
    },
    /// A kernel needs more local memory than the device has.
    #[error("Kernel `{kernel}` needs {needed} bytes of local memory, {device} has {available}")]
    OutOfLocalMemory {
        kernel: String,
        device: String,
        needed: usize,
        available: usize,
    },
    /// The generated program was rejected.
    #[error("Failed to compile kernel `{kernel}`: {reason}")]
    Compile { kernel: String, reason: String },
    /// A positional kernel argument does not match the kernel signature.
    #[error("Kernel `{kernel}` argument {index}: {reason}")]
    Argument {
        kernel: String,
        index: usize,
        reason: String,
    },
    /// A launch range that cannot be executed.
    #[error("Invalid launch range: global {global}, local {local}")]
    InvalidRange { global: usize, local: usize },
    /// A transfer touched memory outside a buffer.
    #[error("Access of {len} elements at offset {offset} exceeds buffer of {size}")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// The command queue of a device is gone.
    #[error("Command queue of {0} is closed")]
    QueueClosed(String),
    /// A lock guarding device state was poisoned by a panicking thread.
    #[error("Poisoned lock: {0}")]
    Poisoned(&'static str),
    /// The device worker thread could not be started.
    #[error("Failed to start device {device}: {reason}")]
    Spawn { device: String, reason: String },
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Trait bound for elements a stencil can convolve.
///
/// On top of [`KernelElem`] an element knows its name in generated device
/// source.
pub trait StencilElem: KernelElem + 'static {
    /// Type name used in generated kernels.
    const TYPE_NAME: &'static str;
}

impl StencilElem for f32 {
    const TYPE_NAME: &'static str = "float";
}

impl StencilElem for f64 {
    const TYPE_NAME: &'static str = "double";
}

impl StencilElem for i32 {
    const TYPE_NAME: &'static str = "int";
}

impl StencilElem for i64 {
    const TYPE_NAME: &'static str = "long";
}

/// Broad class of a compute device.
///
/// The class feeds the strategy policy: scalar CPU-style devices gain
/// nothing from local-memory tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Cpu => write!(f, "CPU"),
            DeviceClass::Gpu => write!(f, "GPU"),
            DeviceClass::Accelerator => write!(f, "Accelerator"),
        }
    }
}

/// Identity of a device context. Kernels compiled in a context are valid for
/// every device of that context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocates a process-unique context identity.
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Global and local (workgroup) size of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: usize,
    pub local: usize,
}

impl NdRange {
    /// Smallest range of `local`-sized workgroups covering `n` work items.
    pub fn covering(n: usize, local: usize) -> Self {
        let local = local.max(1);
        Self {
            global: n.div_ceil(local) * local,
            local,
        }
    }
}

/// A positional kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg<T: StencilElem> {
    Size(usize),
    Offset(isize),
    Flag(bool),
    Int(i32),
    Scalar(T),
    Global(Buffer<T>),
    /// Local memory of the given size in bytes.
    Local(usize),
}

impl<T: StencilElem> KernelArg<T> {
    /// Whether this argument can be bound to a parameter of `kind`.
    pub fn binds_to(&self, kind: ParamKind) -> bool {
        matches!(
            (self, kind),
            (KernelArg::Size(_), ParamKind::Size)
                | (KernelArg::Offset(_), ParamKind::Offset)
                | (KernelArg::Flag(_), ParamKind::Flag)
                | (KernelArg::Int(_), ParamKind::Int)
                | (KernelArg::Scalar(_), ParamKind::Scalar)
                | (KernelArg::Global(_), ParamKind::GlobalConst)
                | (KernelArg::Global(_), ParamKind::Global)
                | (KernelArg::Local(_), ParamKind::Local)
                | (KernelArg::Local(_), ParamKind::LocalConst)
        )
    }
}

/// A compute device with its own memory and in-order command queue.
///
/// # Design
///
/// `Kernel<T>` is the device's compiled form of a [`KernelProgram`]. It is an
/// associated type so that each backend keeps its native handle while the
/// dispatcher stays generic over the backend.
pub trait Device: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// A compiled kernel for elements of type `T`.
    type Kernel<T>: Send + Sync + 'static
    where
        T: StencilElem;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// The class of the device.
    fn class(&self) -> DeviceClass;

    /// The context the device belongs to.
    fn context(&self) -> ContextId;

    /// Largest workgroup the device supports.
    fn max_workgroup_size(&self) -> usize;

    /// Local (workgroup-shared) memory in bytes.
    fn local_mem_size(&self) -> usize;

    /// Allocates a zero-initialised buffer of `len` elements.
    fn alloc<T: StencilElem>(&self, len: usize) -> Result<Buffer<T>>;

    /// Enqueues a host-to-device copy of `data` into `buffer` at `offset`.
    fn enqueue_write<T: StencilElem>(
        &self,
        buffer: &Buffer<T>,
        offset: usize,
        data: Vec<T>,
    ) -> Result<()>;

    /// Enqueues a device-to-host copy of `len` elements at `offset`.
    fn enqueue_read<T: StencilElem>(
        &self,
        buffer: &Buffer<T>,
        offset: usize,
        len: usize,
    ) -> Result<PendingRead<T>>;

    /// Compiles a generated program for this device's context.
    fn compile<T: StencilElem>(&self, program: &KernelProgram<T>) -> Result<Self::Kernel<T>>;

    /// Binds positional `args` and enqueues a launch of `kernel`.
    fn launch<T: StencilElem>(
        &self,
        kernel: &Self::Kernel<T>,
        args: Vec<KernelArg<T>>,
        range: NdRange,
    ) -> Result<()>;

    /// Blocks until every command enqueued so far has completed.
    ///
    /// Returns the first error raised by a queued command since the last
    /// `finish`.
    fn finish(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::fresh();
        let b = ContextId::fresh();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_nd_range_covering() {
        assert_eq!(
            NdRange::covering(10, 4),
            NdRange {
                global: 12,
                local: 4
            }
        );
        assert_eq!(NdRange::covering(8, 4).global, 8);
        assert_eq!(NdRange::covering(3, 0).local, 1);
    }

    #[test]
    fn test_arg_binding_kinds() {
        let arg: KernelArg<f32> = KernelArg::Size(3);
        assert!(arg.binds_to(ParamKind::Size));
        assert!(!arg.binds_to(ParamKind::Int));
        assert!(KernelArg::<f32>::Local(16).binds_to(ParamKind::Local));
        assert!(!KernelArg::<f32>::Scalar(1.0).binds_to(ParamKind::Global));
    }

    #[test]
    fn test_device_class_display() {
        assert_eq!(DeviceClass::Gpu.to_string(), "GPU");
        assert_eq!(format!("{}", DeviceClass::Cpu), "CPU");
    }

    #[test]
    fn test_type_names() {
        assert_eq!(<f32 as StencilElem>::TYPE_NAME, "float");
        assert_eq!(<f64 as StencilElem>::TYPE_NAME, "double");
    }
}
