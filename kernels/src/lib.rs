//! Partition-local stencil kernels.
//!
//! Every function in this crate works on the slice owned by a single device
//! partition plus the halo elements that were uploaded for it. They are the
//! host-side bodies of the kernels that `stencil-rs` generates, so the
//! numerical behaviour here is the behaviour of a convolution launch.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod boundary;
pub mod cpu_stencil;
pub mod cpu_window;

pub use boundary::BoundaryView;
pub use cpu_stencil::{cpu_stencil_generic, cpu_stencil_tiled};
pub use cpu_window::{cpu_stencil_window, Window};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// A tiled launch was configured with an empty workgroup.
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `StencilElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Combines a freshly computed convolution value with the previous output.
///
/// A zero `alpha` is an overwrite: the previous value is never read, so a
/// NaN left in `y` does not leak into the result.
#[inline]
pub fn accumulate<T: KernelElem>(prev: T, sum: T, alpha: T, beta: T) -> T {
    if alpha != T::zero() {
        alpha * prev + beta * sum
    } else {
        beta * sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_overwrite_ignores_previous() {
        assert_eq!(accumulate(f64::NAN, 3.0, 0.0, 2.0), 6.0);
    }

    #[test]
    fn test_accumulate_append() {
        assert_eq!(accumulate(1.0, 3.0, 2.0, -1.0), -1.0);
    }
}
