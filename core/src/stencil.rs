//! Fixed-coefficient stencils.
//!
//! # What is a stencil?
//!
//! A stencil of width `w` with centre `c` computes every output from a small
//! window of inputs around it:
//!
//! ```text
//!   y[i] = sum_{j = -lhalo}^{rhalo} s[lhalo + j] * x[i + j]
//!   lhalo = c,  rhalo = w - c - 1
//! ```
//!
//! At the ends of the vector the missing inputs are replaced by the first
//! or last element (edge clamp).
//!
//! # Distributed convolution
//!
//! [`Stencil::convolve`] exchanges halos between the partitions of `x` (see
//! [`crate::halo`]) and then launches one kernel per non-empty partition. The
//! kernel strategy for each device is fixed at construction:
//!
//! - **generic** reads every tap through the boundary logic and works
//!   anywhere;
//! - **tiled** stages the coefficients and a tile of inputs in local memory
//!   per workgroup, which pays off on accelerators for narrow stencils.
//!
//! Launches are enqueued and not waited for. Any later access to `y` goes
//! through the same in-order device queues and sees the result.

use crate::cache::{KernelCache, KernelEntry, KernelVariant};
use crate::codegen::{generic_program, tiled_program, Strategy};
use crate::config::{StencilConfig, StrategyPolicy};
use crate::device::{Buffer, Device, DeviceClass, DeviceError, HostDevice, KernelArg, NdRange, StencilElem};
use crate::error::{Result, StencilError};
use crate::expr::Convolve;
use crate::halo::HaloExchange;
use crate::partition::PartitionedVector;
use log::{debug, trace, warn};
use std::mem::size_of;
use std::sync::{Arc, Mutex};

/// Launch plan of one device, fixed at construction.
struct DevicePlan<T: StencilElem, D: Device> {
    strategy: Strategy,
    entry: Arc<KernelEntry<T, D>>,
    /// The entry's workgroup size, capped by what this device supports.
    workgroup_size: usize,
    /// Local memory for the coefficient tile, in bytes.
    local_s: usize,
    /// Local memory for the input tile, in bytes.
    local_x: usize,
}

/// A 1-D stencil over vectors partitioned across `devices`.
///
/// # Example
///
/// ```
/// use stencil_rs::{HostDevice, HostDeviceConfig, PartitionedVector, Stencil};
///
/// let devices = HostDevice::many(2, HostDeviceConfig::gpu()).unwrap();
/// let x = PartitionedVector::from_slice(&devices, &[0.0, 1.0, 4.0, 9.0, 16.0]).unwrap();
/// let mut y = PartitionedVector::zeros_like(&x).unwrap();
///
/// let laplace = Stencil::new(&devices, &[1.0, -2.0, 1.0], 1).unwrap();
/// (&laplace * &x).assign_to(&mut y).unwrap();
/// assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 2.0, 2.0, -7.0]);
/// ```
pub struct Stencil<T: StencilElem, D: Device = HostDevice> {
    devices: Vec<D>,
    width: usize,
    center: usize,
    coeffs: Vec<Buffer<T>>,
    plans: Vec<DevicePlan<T, D>>,
    /// Serialises calls: the halo buffers are shared by every call.
    halo: Mutex<HaloExchange<T, D>>,
}

impl<T: StencilElem, D: Device> Stencil<T, D> {
    /// Creates a stencil with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if `devices` or `coefficients` is empty, or if
    /// `center >= coefficients.len()`.
    pub fn new(devices: &[D], coefficients: &[T], center: usize) -> Result<Self> {
        Self::with_config(devices, coefficients, center, StencilConfig::default())
    }

    /// Creates a stencil, uploading the coefficients and resolving one
    /// kernel per device.
    ///
    /// # Panics
    ///
    /// Same preconditions as [`Stencil::new`].
    pub fn with_config(
        devices: &[D],
        coefficients: &[T],
        center: usize,
        config: StencilConfig,
    ) -> Result<Self> {
        assert!(!devices.is_empty(), "stencil needs at least one device");
        assert!(!coefficients.is_empty(), "stencil width must be positive");
        assert!(
            center < coefficients.len(),
            "center {} outside stencil of width {}",
            center,
            coefficients.len()
        );

        let width = coefficients.len();
        let lhalo = center;
        let rhalo = width - center - 1;
        let cache = config.cache();

        let mut coeffs = Vec::with_capacity(devices.len());
        for dev in devices {
            let buf = dev.alloc(width)?;
            dev.enqueue_write(&buf, 0, coefficients.to_vec())?;
            coeffs.push(buf);
        }

        let halo = HaloExchange::new(devices, lhalo, rhalo)?;

        let mut plans = Vec::with_capacity(devices.len());
        for dev in devices {
            plans.push(Self::plan(dev, width, &config, &cache)?);
        }

        for dev in devices {
            dev.finish()?;
        }

        Ok(Self {
            devices: devices.to_vec(),
            width,
            center,
            coeffs,
            plans,
            halo: Mutex::new(halo),
        })
    }

    fn plan(
        dev: &D,
        width: usize,
        config: &StencilConfig,
        cache: &KernelCache,
    ) -> Result<DevicePlan<T, D>> {
        let elem = size_of::<T>();
        let wgs = dev.max_workgroup_size();
        let fits = (width + wgs + width - 1) * elem <= dev.local_mem_size();
        let strategy = config.policy.select(dev.class(), width, fits);

        if strategy == Strategy::Tiled && !fits {
            return Err(StencilError::Strategy {
                strategy: strategy.to_string(),
                device: dev.name().to_string(),
                reason: format!(
                    "tiles of a width {} stencil need more than {} bytes of local memory",
                    width,
                    dev.local_mem_size()
                ),
            });
        }
        if let StrategyPolicy::Auto { max_tiled_width } = config.policy {
            if !fits && dev.class() != DeviceClass::Cpu && width <= max_tiled_width {
                warn!(
                    "Width {} stencil does not fit local memory of {}, using generic strategy",
                    width,
                    dev.name()
                );
            }
        }

        let plan = match strategy {
            Strategy::Generic => {
                let entry = cache.get_or_compile(dev, KernelVariant::Generic, || {
                    KernelEntry::compile(dev, &generic_program::<T>(), wgs)
                })?;
                DevicePlan {
                    strategy,
                    workgroup_size: entry.workgroup_size.min(wgs),
                    entry,
                    local_s: 1,
                    local_x: 1,
                }
            }
            Strategy::Tiled => {
                let entry = cache.get_or_compile(dev, KernelVariant::Tiled, || {
                    KernelEntry::compile(dev, &tiled_program::<T>(), wgs)
                })?;
                let block = entry.workgroup_size.min(wgs);
                DevicePlan {
                    strategy,
                    entry,
                    workgroup_size: block,
                    local_s: width * elem,
                    local_x: (block + width - 1) * elem,
                }
            }
        };

        debug!(
            "Width {} stencil uses the {} strategy on {} (workgroup {})",
            width,
            plan.strategy,
            dev.name(),
            plan.workgroup_size
        );
        Ok(plan)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn center(&self) -> usize {
        self.center
    }

    /// Number of inputs left of the output that contribute to it.
    pub fn lhalo(&self) -> usize {
        self.center
    }

    /// Number of inputs right of the output that contribute to it.
    pub fn rhalo(&self) -> usize {
        self.width - self.center - 1
    }

    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    /// Strategy used on device `d`.
    pub fn strategy(&self, d: usize) -> Strategy {
        self.plans[d].strategy
    }

    /// Workgroup size of launches on device `d`.
    pub fn workgroup_size(&self, d: usize) -> usize {
        self.plans[d].workgroup_size
    }

    /// Generated source of the kernel used on device `d`.
    pub fn kernel_source(&self, d: usize) -> &str {
        &self.plans[d].entry.source
    }

    /// Computes `y = alpha * y + beta * (self (*) x)`.
    ///
    /// A zero `alpha` overwrites `y` without reading it. `x` and `y` must
    /// live on the stencil's devices with identical partitioning.
    pub fn convolve(
        &self,
        x: &PartitionedVector<T, D>,
        y: &mut PartitionedVector<T, D>,
        alpha: T,
        beta: T,
    ) -> Result<()> {
        check_layout(&self.devices, x, y)?;

        let mut halo = self
            .halo
            .lock()
            .map_err(|_| DeviceError::Poisoned("stencil call lock"))?;
        halo.exchange(x)?;

        let ndev = self.devices.len();
        for (d, dev) in self.devices.iter().enumerate() {
            let psize = x.part_size(d);
            if psize == 0 {
                continue;
            }
            let plan = &self.plans[d];
            let args = vec![
                KernelArg::Size(psize),
                KernelArg::Flag(d > 0),
                KernelArg::Flag(d + 1 < ndev),
                KernelArg::Int(self.lhalo() as i32),
                KernelArg::Int(self.rhalo() as i32),
                KernelArg::Global(self.coeffs[d].clone()),
                KernelArg::Global(x.buffer(d).clone()),
                KernelArg::Global(halo.buffer(d).clone()),
                KernelArg::Global(y.buffer(d).clone()),
                KernelArg::Scalar(alpha),
                KernelArg::Scalar(beta),
                KernelArg::Local(plan.local_s),
                KernelArg::Local(plan.local_x),
            ];
            let range = NdRange::covering(psize, plan.workgroup_size);
            trace!("Convolving {} elements on {}", psize, dev.name());
            dev.launch(&plan.entry.kernel, args, range)?;
        }

        Ok(())
    }
}

/// Checks that `x` and `y` are partitioned across `devices` the same way.
pub(crate) fn check_layout<T: StencilElem, D: Device>(
    devices: &[D],
    x: &PartitionedVector<T, D>,
    y: &PartitionedVector<T, D>,
) -> Result<()> {
    if x.devices() != devices {
        return Err(StencilError::LayoutMismatch(
            "input vector does not live on the stencil's devices".to_string(),
        ));
    }
    if !x.same_layout(y) {
        return Err(StencilError::LayoutMismatch(
            "input and output vectors are partitioned differently".to_string(),
        ));
    }
    Ok(())
}

impl<T: StencilElem, D: Device> Convolve<T, D> for Stencil<T, D> {
    fn convolve(
        &self,
        x: &PartitionedVector<T, D>,
        y: &mut PartitionedVector<T, D>,
        alpha: T,
        beta: T,
    ) -> Result<()> {
        Stencil::convolve(self, x, y, alpha, beta)
    }
}

impl<T: StencilElem, D: Device> std::fmt::Debug for Stencil<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stencil")
            .field("width", &self.width)
            .field("center", &self.center)
            .field("devices", &self.devices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDeviceConfig;

    fn config() -> StencilConfig {
        StencilConfig::default().with_cache(Arc::new(KernelCache::new()))
    }

    #[test]
    fn test_halo_widths() {
        let devs = HostDevice::many(1, HostDeviceConfig::gpu()).unwrap();
        let s = Stencil::with_config(&devs, &[1.0f32, 2.0, 3.0, 4.0], 1, config()).unwrap();
        assert_eq!((s.lhalo(), s.rhalo()), (1, 2));
        assert_eq!(s.lhalo() + s.rhalo() + 1, s.width());
    }

    #[test]
    #[should_panic(expected = "center 3 outside stencil of width 3")]
    fn test_center_out_of_range_panics() {
        let devs = HostDevice::many(1, HostDeviceConfig::gpu()).unwrap();
        let _ = Stencil::new(&devs, &[1.0f32, 2.0, 3.0], 3);
    }

    #[test]
    #[should_panic(expected = "stencil needs at least one device")]
    fn test_no_devices_panics() {
        let _ = Stencil::<f32>::new(&[], &[1.0], 0);
    }

    #[test]
    fn test_strategy_selection() {
        let gpu = HostDevice::new(HostDeviceConfig::gpu()).unwrap();
        let cpu = HostDevice::new(HostDeviceConfig::cpu()).unwrap();
        let devs = vec![gpu, cpu];

        let narrow = Stencil::with_config(&devs, &[1.0f64; 5], 2, config()).unwrap();
        assert_eq!(narrow.strategy(0), Strategy::Tiled);
        assert_eq!(narrow.strategy(1), Strategy::Generic);
        assert!(narrow.kernel_source(0).contains("kernel void fast_conv("));

        let wide = Stencil::with_config(&devs, &[1.0f64; 65], 32, config()).unwrap();
        assert_eq!(wide.strategy(0), Strategy::Generic);
        assert!(wide.kernel_source(0).contains("kernel void slow_conv("));
    }

    #[test]
    fn test_local_memory_fallback_and_forced_tiled() {
        // 256-wide groups of f64 with a width 9 stencil need (9 + 256 + 8) * 8 bytes.
        let small = HostDeviceConfig::gpu().with_local_mem_size(1024);
        let devs = vec![HostDevice::new(small).unwrap()];

        let auto = Stencil::with_config(&devs, &[1.0f64; 9], 4, config()).unwrap();
        assert_eq!(auto.strategy(0), Strategy::Generic);

        let forced = Stencil::with_config(
            &devs,
            &[1.0f64; 9],
            4,
            config().with_policy(StrategyPolicy::Force(Strategy::Tiled)),
        );
        assert!(matches!(forced, Err(StencilError::Strategy { .. })));
    }

    #[test]
    fn test_kernels_are_shared_between_stencils() {
        let cache = Arc::new(KernelCache::new());
        let devs = HostDevice::many(2, HostDeviceConfig::gpu()).unwrap();
        let config = StencilConfig::default().with_cache(Arc::clone(&cache));

        let _a = Stencil::with_config(&devs, &[1.0f32, -1.0], 0, config.clone()).unwrap();
        let _b = Stencil::with_config(&devs, &[1.0f32, 2.0, 1.0], 1, config.clone()).unwrap();
        // One tiled kernel per context.
        assert_eq!(cache.compile_count(), 2);

        let _c = Stencil::with_config(&devs, &[1.0f64, 2.0, 1.0], 1, config).unwrap();
        assert_eq!(cache.compile_count(), 4);
    }

    #[test]
    fn test_layout_mismatch() {
        let devs = HostDevice::many(2, HostDeviceConfig::gpu()).unwrap();
        let s = Stencil::with_config(&devs, &[1.0f64, 1.0, 1.0], 1, config()).unwrap();

        let x = PartitionedVector::from_slice_with_sizes(&devs, &[1.0; 4], &[2, 2]).unwrap();
        let mut y = PartitionedVector::zeros_with_sizes(&devs, &[1, 3]).unwrap();
        assert!(matches!(
            s.convolve(&x, &mut y, 0.0, 1.0),
            Err(StencilError::LayoutMismatch(_))
        ));

        let others = HostDevice::many(2, HostDeviceConfig::gpu()).unwrap();
        let z = PartitionedVector::from_slice(&others, &[1.0; 4]).unwrap();
        let mut w = PartitionedVector::zeros_like(&z).unwrap();
        assert!(s.convolve(&z, &mut w, 0.0, 1.0).is_err());
    }
}
