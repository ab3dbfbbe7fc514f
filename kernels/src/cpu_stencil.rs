use crate::{accumulate, BoundaryView, KernelElem, KernelError, Result};
use rayon::prelude::*;

fn check_shapes<T: KernelElem>(x: &BoundaryView<'_, T>, coeffs: &[T], y: &[T]) -> Result<()> {
    if coeffs.len() != x.width() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![x.width()],
            got: vec![coeffs.len()],
        });
    }
    if y.len() != x.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![x.len()],
            got: vec![y.len()],
        });
    }
    Ok(())
}

/// Generic stencil convolution of one partition.
///
/// One independent evaluation per output element: every tap goes through the
/// boundary-aware read of `x`.
///
/// `y[i] = alpha * y[i] + beta * sum_k coeffs[k] * x.read(i + k - lhalo)`
///
/// # Arguments
///
/// * `x` - Partition input together with its halo.
/// * `coeffs` - Stencil coefficients, `lhalo + rhalo + 1` of them.
/// * `y` - Partition output, same length as the input partition.
/// * `alpha` - Scale of the previous output. Zero means overwrite.
/// * `beta` - Scale of the convolution.
pub fn cpu_stencil_generic<T: KernelElem>(
    x: &BoundaryView<'_, T>,
    coeffs: &[T],
    y: &mut [T],
    alpha: T,
    beta: T,
) -> Result<()> {
    check_shapes(x, coeffs, y)?;
    let lhalo = x.lhalo() as isize;

    y.par_iter_mut().enumerate().for_each(|(i, out)| {
        let base = i as isize - lhalo;
        let mut sum = T::zero();
        for (k, &c) in coeffs.iter().enumerate() {
            sum += c * x.read(base + k as isize);
        }
        *out = accumulate(*out, sum, alpha, beta);
    });

    Ok(())
}

/// Tiled stencil convolution of one partition.
///
/// Outputs are processed in workgroups of `block_size`. Each group stages the
/// coefficients and a tile of `block_size + lhalo + rhalo` inputs (read once
/// through the boundary policy), then computes every output of the group from
/// the tile alone. The tap order matches [`cpu_stencil_generic`], so both
/// produce identical results.
///
/// The last group loads a full tile even when it has fewer outputs; reads past
/// the halo window come back as zero and are never used.
pub fn cpu_stencil_tiled<T: KernelElem>(
    x: &BoundaryView<'_, T>,
    coeffs: &[T],
    y: &mut [T],
    alpha: T,
    beta: T,
    block_size: usize,
) -> Result<()> {
    check_shapes(x, coeffs, y)?;
    if block_size == 0 {
        return Err(KernelError::InvalidBlockSize(block_size));
    }

    let lhalo = x.lhalo() as isize;
    let tile_len = block_size + x.lhalo() + x.rhalo();

    y.par_chunks_mut(block_size)
        .enumerate()
        .for_each(|(group, out)| {
            // Group-local memory: coefficient copy and input tile.
            let stage_s = coeffs.to_vec();
            let first = (group * block_size) as isize - lhalo;
            let tile: Vec<T> = (0..tile_len)
                .map(|i| x.read(first + i as isize))
                .collect();

            for (l_id, out) in out.iter_mut().enumerate() {
                let mut sum = T::zero();
                for (k, &c) in stage_s.iter().enumerate() {
                    sum += c * tile[l_id + k];
                }
                *out = accumulate(*out, sum, alpha, beta);
            }
        });

    Ok(())
}
