//! Stencil configuration.
//!
//! Construction-time choices of a stencil live here: how the convolution
//! strategy is picked per device, and which kernel cache compiled programs
//! go to.

use crate::cache::KernelCache;
use crate::codegen::Strategy;
use crate::device::DeviceClass;
use std::sync::Arc;

/// Widest stencil the automatic policy runs with the tiled strategy.
pub const DEFAULT_MAX_TILED_WIDTH: usize = 64;

/// How a stencil picks its convolution strategy on each device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyPolicy {
    /// Tiled on accelerators for stencils up to `max_tiled_width` whose tiles
    /// fit local memory; generic otherwise.
    Auto { max_tiled_width: usize },
    /// Always the given strategy.
    Force(Strategy),
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        StrategyPolicy::Auto {
            max_tiled_width: DEFAULT_MAX_TILED_WIDTH,
        }
    }
}

impl StrategyPolicy {
    /// Picks the strategy for a device of class `class`.
    ///
    /// `fits_local` tells whether the coefficient and input tiles of the
    /// tiled strategy fit the device's local memory.
    pub fn select(&self, class: DeviceClass, width: usize, fits_local: bool) -> Strategy {
        match *self {
            StrategyPolicy::Force(strategy) => strategy,
            StrategyPolicy::Auto { max_tiled_width } => {
                if class == DeviceClass::Cpu || width > max_tiled_width || !fits_local {
                    Strategy::Generic
                } else {
                    Strategy::Tiled
                }
            }
        }
    }
}

/// Construction options of a [`crate::Stencil`].
#[derive(Debug, Clone, Default)]
pub struct StencilConfig {
    pub policy: StrategyPolicy,
    /// Kernel cache to use. `None` means [`KernelCache::shared`].
    pub cache: Option<Arc<KernelCache>>,
}

impl StencilConfig {
    pub fn with_policy(mut self, policy: StrategyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cache(mut self, cache: Arc<KernelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The cache this configuration resolves to.
    pub fn cache(&self) -> Arc<KernelCache> {
        self.cache.clone().unwrap_or_else(KernelCache::shared)
    }
}
