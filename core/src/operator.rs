//! User-defined stencil operators.
//!
//! A fixed coefficient vector only expresses weighted sums. A
//! [`StencilOperator`] instead supplies an arbitrary expression over the
//! window around each output, for example `x[0] + (x[-1] + x[1])^3`.
//!
//! The operator provides the expression twice: as device source (`BODY`,
//! which sees a pointer `X` to the centre element and may read `X[-lhalo]`
//! through `X[rhalo]`) and as the equivalent host function (`apply`). The
//! [`stencil_operator!`](crate::stencil_operator) macro declares both in one
//! place.
//!
//! [`UserStencil`] runs an operator with the same halo exchange as
//! [`crate::Stencil`] and always uses the tiled strategy.

use crate::cache::{KernelCache, KernelEntry, KernelVariant};
use crate::codegen::conv::OPERATOR_KERNEL;
use crate::codegen::operator_program;
use crate::device::{Device, DeviceError, HostDevice, KernelArg, NdRange, StencilElem};
use crate::error::Result;
use crate::expr::{Conv, Convolve};
use crate::halo::HaloExchange;
use crate::partition::PartitionedVector;
use crate::stencil::check_layout;
use log::trace;
use std::any::TypeId;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::{Arc, Mutex};
use stencil_rs_kernels::Window;

/// An elementwise expression over a fixed window.
///
/// `BODY` and `apply` describe the same expression and must agree; nothing
/// checks that they do. A [`HostDevice`] only validates `BODY` (non-empty,
/// contains a `return`) at compile time and evaluates `apply` on launch.
pub trait StencilOperator: Send + Sync + 'static {
    type Elem: StencilElem;
    /// Window width.
    const WIDTH: usize;
    /// Position of the output element inside the window.
    const CENTER: usize;
    /// Device source of the expression.
    const BODY: &'static str;

    /// Host evaluation of the expression; `x[0]` is the centre element.
    fn apply(x: &Window<'_, Self::Elem>) -> Self::Elem;
}

/// Declares a [`StencilOperator`] type.
///
/// ```
/// use stencil_rs::stencil_operator;
///
/// stencil_operator!(
///     /// `x[0] + (x[-1] + x[1])^3`
///     pub Pow3, f64, 3, 1,
///     "return X[0] + pow(X[-1] + X[1], 3.0);",
///     |x| x[0] + (x[-1] + x[1]).powi(3)
/// );
/// ```
#[macro_export]
macro_rules! stencil_operator {
    (
        $(#[$meta:meta])*
        $vis:vis $name:ident, $elem:ty, $width:expr, $center:expr, $body:expr,
        |$x:ident| $apply:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::StencilOperator for $name {
            type Elem = $elem;
            const WIDTH: usize = $width;
            const CENTER: usize = $center;
            const BODY: &'static str = $body;

            fn apply($x: &$crate::Window<'_, $elem>) -> $elem {
                $apply
            }
        }
    };
}

/// Largest workgroup size whose input tile of `wgs + width - 1` elements fits
/// `local_mem` bytes, starting from `max` and halving.
fn operator_workgroup_size(max: usize, width: usize, elem: usize, local_mem: usize) -> Option<usize> {
    let mut wgs = max.max(1);
    loop {
        if (width + wgs - 1) * elem <= local_mem {
            return Some(wgs);
        }
        if wgs == 1 {
            return None;
        }
        wgs /= 2;
    }
}

/// A stencil that evaluates a user operator.
pub struct UserStencil<Op: StencilOperator, D: Device = HostDevice> {
    devices: Vec<D>,
    cache: Arc<KernelCache>,
    halo: Mutex<HaloExchange<Op::Elem, D>>,
    _op: PhantomData<fn() -> Op>,
}

impl<Op: StencilOperator, D: Device> UserStencil<Op, D> {
    /// Creates the operator on `devices`, using the shared kernel cache.
    ///
    /// Kernels are compiled on the first convolution.
    ///
    /// # Panics
    ///
    /// Panics if `devices` is empty, `Op::WIDTH` is zero or
    /// `Op::CENTER >= Op::WIDTH`.
    pub fn new(devices: &[D]) -> Result<Self> {
        Self::with_cache(devices, KernelCache::shared())
    }

    pub fn with_cache(devices: &[D], cache: Arc<KernelCache>) -> Result<Self> {
        assert!(!devices.is_empty(), "stencil needs at least one device");
        assert!(Op::WIDTH > 0, "stencil width must be positive");
        assert!(
            Op::CENTER < Op::WIDTH,
            "center {} outside stencil of width {}",
            Op::CENTER,
            Op::WIDTH
        );

        let halo = HaloExchange::new(devices, Self::lhalo(), Self::rhalo())?;
        Ok(Self {
            devices: devices.to_vec(),
            cache,
            halo: Mutex::new(halo),
            _op: PhantomData,
        })
    }

    pub fn lhalo() -> usize {
        Op::CENTER
    }

    pub fn rhalo() -> usize {
        Op::WIDTH - Op::CENTER - 1
    }

    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    /// Deferred application to `x`.
    pub fn call<'a>(&'a self, x: &'a PartitionedVector<Op::Elem, D>) -> Conv<'a, Self, Op::Elem, D> {
        Conv::new(self, x)
    }

    fn entry(&self, dev: &D) -> Result<Arc<KernelEntry<Op::Elem, D>>> {
        let variant = KernelVariant::Operator(TypeId::of::<Op>());
        let entry = self.cache.get_or_compile(dev, variant, || {
            let elem = size_of::<Op::Elem>();
            let wgs = operator_workgroup_size(
                dev.max_workgroup_size(),
                Op::WIDTH,
                elem,
                dev.local_mem_size(),
            )
            .ok_or_else(|| Self::no_local_memory(dev))?;
            KernelEntry::compile(dev, &operator_program::<Op>(), wgs)
        })?;
        Ok(entry)
    }

    fn no_local_memory(dev: &D) -> DeviceError {
        DeviceError::OutOfLocalMemory {
            kernel: OPERATOR_KERNEL.to_string(),
            device: dev.name().to_string(),
            needed: Op::WIDTH * size_of::<Op::Elem>(),
            available: dev.local_mem_size(),
        }
    }

    /// Computes `y = alpha * y + beta * op(x)`.
    pub fn convolve(
        &self,
        x: &PartitionedVector<Op::Elem, D>,
        y: &mut PartitionedVector<Op::Elem, D>,
        alpha: Op::Elem,
        beta: Op::Elem,
    ) -> Result<()> {
        check_layout(&self.devices, x, y)?;

        let entries = self
            .devices
            .iter()
            .map(|dev| self.entry(dev))
            .collect::<Result<Vec<_>>>()?;

        let mut halo = self
            .halo
            .lock()
            .map_err(|_| DeviceError::Poisoned("stencil call lock"))?;
        halo.exchange(x)?;

        let ndev = self.devices.len();
        let elem = size_of::<Op::Elem>();
        for (d, (dev, entry)) in self.devices.iter().zip(&entries).enumerate() {
            let psize = x.part_size(d);
            if psize == 0 {
                continue;
            }
            // The entry may have been sized for another device of the context.
            let wgs = operator_workgroup_size(
                entry.workgroup_size.min(dev.max_workgroup_size()),
                Op::WIDTH,
                elem,
                dev.local_mem_size(),
            )
            .ok_or_else(|| Self::no_local_memory(dev))?;
            let args = vec![
                KernelArg::Size(psize),
                KernelArg::Flag(d > 0),
                KernelArg::Flag(d + 1 < ndev),
                KernelArg::Int(Self::lhalo() as i32),
                KernelArg::Int(Self::rhalo() as i32),
                KernelArg::Global(x.buffer(d).clone()),
                KernelArg::Global(halo.buffer(d).clone()),
                KernelArg::Global(y.buffer(d).clone()),
                KernelArg::Scalar(alpha),
                KernelArg::Scalar(beta),
                KernelArg::Local((wgs + Op::WIDTH - 1) * elem),
            ];
            trace!("Applying operator to {} elements on {}", psize, dev.name());
            dev.launch(&entry.kernel, args, NdRange::covering(psize, wgs))?;
        }

        Ok(())
    }
}

impl<Op: StencilOperator, D: Device> Convolve<Op::Elem, D> for UserStencil<Op, D> {
    fn convolve(
        &self,
        x: &PartitionedVector<Op::Elem, D>,
        y: &mut PartitionedVector<Op::Elem, D>,
        alpha: Op::Elem,
        beta: Op::Elem,
    ) -> Result<()> {
        UserStencil::convolve(self, x, y, alpha, beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceConfig;

    crate::stencil_operator!(
        Smooth, f64, 3, 1,
        "return 0.25 * X[-1] + 0.5 * X[0] + 0.25 * X[1];",
        |x| 0.25 * x[-1] + 0.5 * x[0] + 0.25 * x[1]
    );

    crate::stencil_operator!(
        Forward, i32, 2, 0,
        "return X[1] - X[0];",
        |x| x[1] - x[0]
    );

    crate::stencil_operator!(
        Mismatched, i32, 1, 0,
        "return X[0];",
        |x| 2 * x[0]
    );

    #[test]
    fn test_host_device_evaluates_apply_not_body() {
        let devs = HostDevice::many(1, HostDeviceConfig::gpu()).unwrap();
        let op = UserStencil::<Mismatched>::with_cache(&devs, Arc::new(KernelCache::new())).unwrap();
        let x = PartitionedVector::from_slice(&devs, &[1, 2, 3]).unwrap();
        assert_eq!(op.call(&x).eval().unwrap().to_vec().unwrap(), vec![2, 4, 6]);
    }

    #[test]
    fn test_operator_workgroup_size() {
        assert_eq!(operator_workgroup_size(256, 3, 8, 32 * 1024), Some(256));
        // (3 + 256 - 1) * 8 = 2064 does not fit 1024 bytes, (3 + 64 - 1) * 8 does.
        assert_eq!(operator_workgroup_size(256, 3, 8, 1024), Some(64));
        assert_eq!(operator_workgroup_size(256, 300, 8, 1024), None);
    }

    #[test]
    fn test_halo_widths() {
        assert_eq!(UserStencil::<Smooth>::lhalo(), 1);
        assert_eq!(UserStencil::<Smooth>::rhalo(), 1);
        assert_eq!(UserStencil::<Forward>::lhalo(), 0);
        assert_eq!(UserStencil::<Forward>::rhalo(), 1);
    }

    #[test]
    fn test_smoothing_across_devices() {
        let devs = HostDevice::many(3, HostDeviceConfig::gpu().with_workgroup_size(4)).unwrap();
        let op = UserStencil::<Smooth>::with_cache(&devs, Arc::new(KernelCache::new())).unwrap();
        let x = PartitionedVector::from_slice(&devs, &[4.0, 8.0, 0.0, 4.0, 8.0, 4.0, 0.0]).unwrap();
        let y = op.call(&x).eval().unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![5.0, 5.0, 3.0, 4.0, 6.0, 4.0, 1.0]);
    }

    #[test]
    fn test_compiles_lazily_once() {
        let cache = Arc::new(KernelCache::new());
        let devs = HostDevice::many(2, HostDeviceConfig::gpu()).unwrap();
        let op = UserStencil::<Forward>::with_cache(&devs, Arc::clone(&cache)).unwrap();
        assert_eq!(cache.compile_count(), 0);

        let x = PartitionedVector::from_slice(&devs, &[1, 4, 9, 16]).unwrap();
        let mut y = PartitionedVector::zeros_like(&x).unwrap();
        op.convolve(&x, &mut y, 0, 1).unwrap();
        op.convolve(&x, &mut y, 1, 1).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![6, 10, 14, 0]);
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn test_local_memory_too_small() {
        let tiny = HostDeviceConfig::gpu().with_local_mem_size(8);
        let devs = vec![HostDevice::new(tiny).unwrap()];
        let op = UserStencil::<Smooth>::with_cache(&devs, Arc::new(KernelCache::new())).unwrap();
        let x = PartitionedVector::from_slice(&devs, &[1.0, 2.0]).unwrap();
        let mut y = PartitionedVector::zeros_like(&x).unwrap();
        assert!(op.convolve(&x, &mut y, 0.0, 1.0).is_err());
    }
}
