//! Kernel source generation.
//!
//! # Why generate source?
//!
//! A stencil kernel is specialised on its element type and, for user
//! operators, on an arbitrary expression body. Instead of shipping one
//! precompiled kernel per combination, the engine *writes* the kernel as
//! OpenCL C at runtime and hands it to the device compiler. The result is
//! cached per device context (see [`crate::cache`]), so the cost is paid once.
//!
//! A generated program carries three things:
//!
//! - the source text, produced by [`SourceGenerator`];
//! - the [`KernelSignature`], i.e. the ordered, typed parameter list that
//!   positional launch arguments are bound against;
//! - the [`ConvBody`] the kernel computes, which is what a host device
//!   executes.

use std::fmt;
use stencil_rs_kernels::Window;

pub mod conv;
pub mod source;

pub use conv::{generic_program, operator_program, tiled_program};
pub use source::SourceGenerator;

/// Type and address space of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Unsigned element count.
    Size,
    /// Signed offset.
    Offset,
    /// Boolean flag passed as a byte.
    Flag,
    Int,
    /// A value of the element type.
    Scalar,
    /// Read-only global memory.
    GlobalConst,
    /// Writable global memory.
    Global,
    /// Read-only local memory.
    LocalConst,
    /// Writable local memory.
    Local,
}

impl ParamKind {
    /// Whether the parameter points into device memory.
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            ParamKind::GlobalConst | ParamKind::Global | ParamKind::LocalConst | ParamKind::Local
        )
    }

    fn type_prefix(&self, elem: &str) -> String {
        match self {
            ParamKind::Size => "ulong".to_string(),
            ParamKind::Offset => "long".to_string(),
            ParamKind::Flag => "char".to_string(),
            ParamKind::Int => "int".to_string(),
            ParamKind::Scalar => elem.to_string(),
            ParamKind::GlobalConst => format!("global const {elem} * restrict"),
            ParamKind::Global => format!("global {elem} * restrict"),
            ParamKind::LocalConst => format!("local const {elem} *"),
            ParamKind::Local => format!("local {elem} *"),
        }
    }
}

/// A named kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl Param {
    pub const fn new(name: &'static str, kind: ParamKind) -> Self {
        Self { name, kind }
    }

    /// Declaration of the parameter in source, e.g. `global float * restrict y`.
    pub fn declaration(&self, elem: &str) -> String {
        format!("{} {}", self.kind.type_prefix(elem), self.name)
    }
}

/// Ordered parameter list of a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSignature {
    params: Vec<Param>,
}

impl KernelSignature {
    pub fn new(params: Vec<Param>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Position of the parameter called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Comma separated declarations for a function header.
    pub fn declarations(&self, elem: &str) -> String {
        self.params
            .iter()
            .map(|p| p.declaration(elem))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// How a convolution kernel reads its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Every tap of every output goes through the boundary read. Works for any
    /// width and on any device.
    Generic,
    /// Workgroups stage coefficients and an input tile in local memory first.
    Tiled,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Generic => write!(f, "generic"),
            Strategy::Tiled => write!(f, "tiled"),
        }
    }
}

/// What a convolution kernel computes per output.
pub enum ConvBody<T> {
    /// Weighted sum with a coefficient vector bound at launch.
    Coefficients,
    /// A user expression over the window around the output.
    Expression {
        /// Device source of the expression; sees `X` at the centre element.
        source: &'static str,
        /// Host evaluation of the same expression.
        apply: fn(&Window<'_, T>) -> T,
    },
}

impl<T> Clone for ConvBody<T> {
    fn clone(&self) -> Self {
        match self {
            ConvBody::Coefficients => ConvBody::Coefficients,
            ConvBody::Expression { source, apply } => ConvBody::Expression {
                source: *source,
                apply: *apply,
            },
        }
    }
}

impl<T> fmt::Debug for ConvBody<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvBody::Coefficients => write!(f, "Coefficients"),
            ConvBody::Expression { source, .. } => f
                .debug_struct("Expression")
                .field("source", source)
                .finish_non_exhaustive(),
        }
    }
}

/// A generated kernel, ready to be compiled by a device.
#[derive(Debug, Clone)]
pub struct KernelProgram<T> {
    pub name: String,
    pub strategy: Strategy,
    pub body: ConvBody<T>,
    pub signature: KernelSignature,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_declarations() {
        assert_eq!(
            Param::new("x", ParamKind::GlobalConst).declaration("float"),
            "global const float * restrict x"
        );
        assert_eq!(
            Param::new("n", ParamKind::Size).declaration("double"),
            "ulong n"
        );
        assert_eq!(
            Param::new("loc", ParamKind::Local).declaration("int"),
            "local int * loc"
        );
    }

    #[test]
    fn test_signature_lookup() {
        let sig = KernelSignature::new(vec![
            Param::new("n", ParamKind::Size),
            Param::new("alpha", ParamKind::Scalar),
        ]);
        assert_eq!(sig.position("alpha"), Some(1));
        assert_eq!(sig.position("beta"), None);
        assert_eq!(sig.declarations("float"), "ulong n, float alpha");
        assert!(!ParamKind::Scalar.is_pointer());
        assert!(ParamKind::LocalConst.is_pointer());
    }
}
