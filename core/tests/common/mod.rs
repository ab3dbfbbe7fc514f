#![allow(dead_code)]

use std::sync::Arc;
use stencil_rs::{HostDevice, HostDeviceConfig, KernelCache, StencilConfig};

/// Single-device reference: clamped reads at both ends of `x`.
pub fn reference(coeffs: &[f64], center: usize, x: &[f64], y: &[f64], alpha: f64, beta: f64) -> Vec<f64> {
    let n = x.len() as isize;
    (0..x.len())
        .map(|i| {
            let mut sum = 0.0;
            for (k, &c) in coeffs.iter().enumerate() {
                let j = (i as isize + k as isize - center as isize).clamp(0, n - 1);
                sum += c * x[j as usize];
            }
            if alpha != 0.0 {
                alpha * y[i] + beta * sum
            } else {
                beta * sum
            }
        })
        .collect()
}

pub fn gpus(n: usize) -> Vec<HostDevice> {
    HostDevice::many(n, HostDeviceConfig::gpu().with_workgroup_size(8)).unwrap()
}

pub fn cpus(n: usize) -> Vec<HostDevice> {
    HostDevice::many(n, HostDeviceConfig::cpu()).unwrap()
}

/// Configuration with a private kernel cache.
pub fn isolated() -> StencilConfig {
    StencilConfig::default().with_cache(Arc::new(KernelCache::new()))
}

/// Cuts `[0, len)` into partitions at the given points.
pub fn sizes_from_cuts(len: usize, cuts: &[usize]) -> Vec<usize> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (len + 1)).collect();
    points.sort_unstable();
    let mut sizes = Vec::with_capacity(points.len() + 1);
    let mut prev = 0;
    for p in points {
        sizes.push(p - prev);
        prev = p;
    }
    sizes.push(len - prev);
    sizes
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
