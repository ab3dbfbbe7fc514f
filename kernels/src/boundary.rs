use crate::KernelElem;

/// Read-only view of one partition and the halo uploaded for it.
///
/// The halo slice is laid out as `[left halo (lhalo) | right halo (rhalo)]`:
/// the left part holds the tail of the left neighbour, right-aligned, and the
/// right part holds the head of the right neighbour.
///
/// # Boundary policy
///
/// [`BoundaryView::read`] resolves an offset relative to the start of the
/// partition:
///
/// - inside `[0, n)` it returns the local element;
/// - left of the partition it returns the halo element when there is a left
///   neighbour (zero once the offset leaves the transferred window), and the
///   first local element otherwise;
/// - right of the partition it does the same with the right neighbour and
///   the last local element.
///
/// The clamp only happens at the true edge of the global vector. A request
/// that falls outside the halo window next to a neighbour yields zero.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryView<'a, T> {
    local: &'a [T],
    halo: &'a [T],
    has_left: bool,
    has_right: bool,
    lhalo: usize,
    rhalo: usize,
}

impl<'a, T: KernelElem> BoundaryView<'a, T> {
    /// Creates a view over a partition slice and its halo buffer.
    ///
    /// # Arguments
    ///
    /// * `local` - The elements owned by the partition.
    /// * `halo` - The halo buffer uploaded for the partition.
    /// * `has_left` / `has_right` - Whether a neighbour partition exists on that side.
    /// * `lhalo` / `rhalo` - Reach of the stencil to the left and to the right.
    pub fn new(
        local: &'a [T],
        halo: &'a [T],
        has_left: bool,
        has_right: bool,
        lhalo: usize,
        rhalo: usize,
    ) -> Self {
        Self {
            local,
            halo,
            has_left,
            has_right,
            lhalo,
            rhalo,
        }
    }

    /// A view over a whole vector with no neighbours: both edges clamp.
    pub fn standalone(local: &'a [T], lhalo: usize, rhalo: usize) -> Self {
        Self::new(local, &[], false, false, lhalo, rhalo)
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    pub fn lhalo(&self) -> usize {
        self.lhalo
    }

    pub fn rhalo(&self) -> usize {
        self.rhalo
    }

    /// Stencil width implied by the two reaches.
    pub fn width(&self) -> usize {
        self.lhalo + self.rhalo + 1
    }

    /// Reads the element at `g_id`, an offset relative to the partition start.
    #[inline]
    pub fn read(&self, g_id: isize) -> T {
        let n = self.local.len() as isize;

        if g_id >= 0 && g_id < n {
            self.local[g_id as usize]
        } else if g_id < 0 {
            if self.has_left {
                let idx = self.lhalo as isize + g_id;
                if idx >= 0 {
                    self.halo_at(idx as usize)
                } else {
                    T::zero()
                }
            } else {
                self.first()
            }
        } else if self.has_right {
            if g_id < n + self.rhalo as isize {
                self.halo_at((self.lhalo as isize + g_id - n) as usize)
            } else {
                T::zero()
            }
        } else {
            self.last()
        }
    }

    fn halo_at(&self, idx: usize) -> T {
        self.halo.get(idx).copied().unwrap_or_else(T::zero)
    }

    fn first(&self) -> T {
        self.local.first().copied().unwrap_or_else(T::zero)
    }

    fn last(&self) -> T {
        self.local.last().copied().unwrap_or_else(T::zero)
    }
}
