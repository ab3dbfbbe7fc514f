//! # stencil-rs
//!
//! `stencil-rs` convolves vectors that are split across several compute
//! devices with fixed-width 1-D stencils.
//!
//! Each output element depends on a few neighbours on either side. Near a
//! partition boundary some of them live on another device, so every
//! convolution first exchanges *halos* between neighbouring partitions and
//! then runs one generated kernel per device.
//!
//! ## Modules
//!
//! - [`device`]: the [`Device`] trait and the in-process [`HostDevice`].
//! - [`partition`]: vectors partitioned across devices.
//! - [`halo`]: two-phase halo exchange.
//! - [`codegen`]: kernel source generation.
//! - [`cache`]: compiled kernels shared per device context.
//! - [`mod@stencil`]: coefficient stencils and the convolution dispatcher.
//! - [`operator`]: user-defined stencil operators.
//! - [`expr`]: deferred `&stencil * &x` convolutions.
//!
//! ## Example
//!
//! ```rust
//! use stencil_rs::{HostDevice, HostDeviceConfig, PartitionedVector, Stencil};
//!
//! let devices = HostDevice::many(3, HostDeviceConfig::gpu()).unwrap();
//! let x = PartitionedVector::from_slice(&devices, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! let mut y = PartitionedVector::zeros_like(&x).unwrap();
//!
//! // Centred moving sum: y[i] = x[i-1] + x[i] + x[i+1], clamped at the ends.
//! let sum3 = Stencil::new(&devices, &[1.0, 1.0, 1.0], 1).unwrap();
//! sum3.convolve(&x, &mut y, 0.0, 1.0).unwrap();
//! assert_eq!(y.to_vec().unwrap(), vec![4.0, 6.0, 9.0, 12.0, 15.0, 17.0]);
//! ```

pub mod cache;
pub mod codegen;
pub mod config;
pub mod device;
pub mod error;
pub mod expr;
pub mod halo;
pub mod operator;
pub mod partition;
pub mod stencil;

pub use cache::KernelCache;
pub use codegen::Strategy;
pub use config::{StencilConfig, StrategyPolicy};
pub use device::{Device, DeviceClass, DeviceError, HostDevice, HostDeviceConfig, StencilElem};
pub use error::{Result, StencilError};
pub use expr::{Conv, Convolve};
pub use operator::{StencilOperator, UserStencil};
pub use partition::PartitionedVector;
pub use stencil::Stencil;
pub use stencil_rs_kernels::Window;
