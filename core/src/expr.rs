//! Deferred convolutions.
//!
//! `&stencil * &x` does not compute anything. It builds a [`Conv`], a
//! description of `scale * (stencil (*) x)` that is evaluated when it meets
//! its target:
//!
//! ```text
//!   (&s * &x).assign_to(&mut y)      y  = conv
//!   (&s * &x).add_to(&mut y)         y += conv
//!   (&s * &x).sub_from(&mut y)       y -= conv
//!   (-(&s * &x) * 0.5).add_to(y)     y += -0.5 * conv
//! ```
//!
//! Every form maps to one `convolve(x, y, alpha, beta)` call with `alpha`
//! zero (assign) or one (add, subtract) and `beta` the signed scale.

use crate::device::{Device, StencilElem};
use crate::error::Result;
use crate::partition::PartitionedVector;
use crate::stencil::Stencil;
use std::ops::{Mul, Neg};

/// Anything that convolves partitioned vectors as `y = alpha * y + beta * conv(x)`.
pub trait Convolve<T: StencilElem, D: Device> {
    fn convolve(
        &self,
        x: &PartitionedVector<T, D>,
        y: &mut PartitionedVector<T, D>,
        alpha: T,
        beta: T,
    ) -> Result<()>;
}

/// A scaled convolution of `x`, not yet evaluated.
pub struct Conv<'a, S, T: StencilElem, D: Device> {
    op: &'a S,
    x: &'a PartitionedVector<T, D>,
    scale: T,
}

impl<S, T: StencilElem, D: Device> Clone for Conv<'_, S, T, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, T: StencilElem, D: Device> Copy for Conv<'_, S, T, D> {}

impl<'a, S, T, D> Conv<'a, S, T, D>
where
    S: Convolve<T, D>,
    T: StencilElem,
    D: Device,
{
    pub fn new(op: &'a S, x: &'a PartitionedVector<T, D>) -> Self {
        Self {
            op,
            x,
            scale: T::one(),
        }
    }

    pub fn scale(&self) -> T {
        self.scale
    }

    /// `y = scale * conv(x)`.
    pub fn assign_to(&self, y: &mut PartitionedVector<T, D>) -> Result<()> {
        self.op.convolve(self.x, y, T::zero(), self.scale)
    }

    /// `y += scale * conv(x)`.
    pub fn add_to(&self, y: &mut PartitionedVector<T, D>) -> Result<()> {
        self.op.convolve(self.x, y, T::one(), self.scale)
    }

    /// `y -= scale * conv(x)`.
    pub fn sub_from(&self, y: &mut PartitionedVector<T, D>) -> Result<()> {
        self.op.convolve(self.x, y, T::one(), T::zero() - self.scale)
    }

    /// Evaluates into a new vector laid out like `x`.
    pub fn eval(&self) -> Result<PartitionedVector<T, D>> {
        let mut y = PartitionedVector::zeros_like(self.x)?;
        self.assign_to(&mut y)?;
        Ok(y)
    }
}

impl<S, T: StencilElem, D: Device> Mul<T> for Conv<'_, S, T, D> {
    type Output = Self;

    fn mul(self, k: T) -> Self {
        Self {
            scale: self.scale * k,
            ..self
        }
    }
}

impl<S, T: StencilElem, D: Device> Neg for Conv<'_, S, T, D> {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            scale: T::zero() - self.scale,
            ..self
        }
    }
}

impl<'a, T: StencilElem, D: Device> Mul<&'a PartitionedVector<T, D>> for &'a Stencil<T, D> {
    type Output = Conv<'a, Stencil<T, D>, T, D>;

    fn mul(self, x: &'a PartitionedVector<T, D>) -> Self::Output {
        Conv::new(self, x)
    }
}

impl<'a, T: StencilElem, D: Device> Mul<&'a Stencil<T, D>> for &'a PartitionedVector<T, D> {
    type Output = Conv<'a, Stencil<T, D>, T, D>;

    fn mul(self, s: &'a Stencil<T, D>) -> Self::Output {
        Conv::new(s, self)
    }
}
