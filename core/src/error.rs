use crate::device::DeviceError;
use thiserror::Error;

/// Error type for stencil operations.
#[derive(Error, Debug)]
pub enum StencilError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Input and output vectors are not laid out like the stencil.
    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),
    /// Explicit partition sizes do not add up to the vector length.
    #[error("Partition sizes {sizes:?} do not cover a vector of length {len}")]
    Partition { sizes: Vec<usize>, len: usize },
    /// A host transfer addressed elements outside the vector.
    #[error("Region [{offset}, {offset} + {len}) is outside a vector of length {size}")]
    OutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// A forced strategy cannot run on a device.
    #[error("Strategy {strategy} is not usable on {device}: {reason}")]
    Strategy {
        strategy: String,
        device: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, StencilError>;
