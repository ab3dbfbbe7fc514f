use crate::{accumulate, BoundaryView, KernelElem, KernelError, Result};
use rayon::prelude::*;
use std::ops::Index;

/// Window of staged inputs centred on the output being computed.
///
/// Indexed with signed offsets: `w[0]` is the input at the output position,
/// `w[-1]` its left neighbour, `w[1]` its right neighbour, up to the stencil
/// reach on each side.
#[derive(Debug, Clone, Copy)]
pub struct Window<'a, T> {
    tile: &'a [T],
    center: usize,
}

impl<'a, T> Window<'a, T> {
    /// Creates a window over `tile` whose element `center` is offset zero.
    pub fn new(tile: &'a [T], center: usize) -> Self {
        Self { tile, center }
    }

    /// Returns the element at `offset`, or `None` outside the window.
    pub fn get(&self, offset: isize) -> Option<&T> {
        let idx = self.center as isize + offset;
        if idx < 0 {
            return None;
        }
        self.tile.get(idx as usize)
    }

    /// Smallest valid offset.
    pub fn min_offset(&self) -> isize {
        -(self.center as isize)
    }

    /// Largest valid offset.
    pub fn max_offset(&self) -> isize {
        self.tile.len() as isize - self.center as isize - 1
    }
}

impl<T> Index<isize> for Window<'_, T> {
    type Output = T;

    /// # Panics
    ///
    /// Panics when `offset` is outside `[min_offset, max_offset]`.
    fn index(&self, offset: isize) -> &T {
        match self.get(offset) {
            Some(value) => value,
            None => panic!(
                "window offset {} outside [{}, {}]",
                offset,
                self.min_offset(),
                self.max_offset()
            ),
        }
    }
}

/// Tiled convolution of one partition with an arbitrary elementwise operator.
///
/// Same staging as [`crate::cpu_stencil_tiled`], but instead of a weighted sum
/// each output is `op(window)` where the window is centred on the output
/// index and spans `[-lhalo, rhalo]`.
///
/// # Arguments
///
/// * `x` - Partition input together with its halo.
/// * `op` - Operator evaluated once per output.
/// * `y` - Partition output.
/// * `alpha` / `beta` - `y = alpha * y + beta * op(window)`.
/// * `block_size` - Number of outputs per workgroup.
pub fn cpu_stencil_window<T, F>(
    x: &BoundaryView<'_, T>,
    op: F,
    y: &mut [T],
    alpha: T,
    beta: T,
    block_size: usize,
) -> Result<()>
where
    T: KernelElem,
    F: Fn(&Window<'_, T>) -> T + Sync,
{
    if y.len() != x.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![x.len()],
            got: vec![y.len()],
        });
    }
    if block_size == 0 {
        return Err(KernelError::InvalidBlockSize(block_size));
    }

    let lhalo = x.lhalo();
    let width = x.width();
    let tile_len = block_size + width - 1;

    y.par_chunks_mut(block_size)
        .enumerate()
        .for_each(|(group, out)| {
            let first = (group * block_size) as isize - lhalo as isize;
            let tile: Vec<T> = (0..tile_len)
                .map(|i| x.read(first + i as isize))
                .collect();

            for (l_id, out) in out.iter_mut().enumerate() {
                let window = Window::new(&tile[l_id..l_id + width], lhalo);
                let value = op(&window);
                *out = accumulate(*out, value, alpha, beta);
            }
        });

    Ok(())
}
