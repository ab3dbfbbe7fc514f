//! Halo exchange between neighbouring partitions.
//!
//! # The problem
//!
//! Output `i` of a stencil reads inputs `i - lhalo ..= i + rhalo`. Near a
//! partition boundary some of those inputs live on another device. Before a
//! convolution every partition therefore receives a copy of its neighbours'
//! boundary elements, its *halo*:
//!
//! ```text
//!   device 0: | a b c d |              halo of device 1 (lhalo 2, rhalo 1):
//!   device 1: | e f g |                  [ c d | h ]
//!   device 2: | h i j k |
//! ```
//!
//! # Protocol
//!
//! The exchange is host mediated and runs in two globally synchronised
//! phases:
//!
//! 1. **Read**: asynchronous reads of `[start - lhalo, start)` and
//!    `[end, end + rhalo)` (clipped to the vector) are issued for every
//!    non-empty partition with a neighbour, then every device is finished.
//! 2. **Write**: each read lands in the partition's host staging slot (left
//!    data right-aligned, right data left-aligned). Elements the vector could
//!    not provide are filled by replicating the nearest element that was
//!    read, or the global first/last element when nothing was. Each slot is
//!    uploaded to the partition's device halo buffer, then every device is
//!    finished again.

use crate::device::{Buffer, Device, HostDevice, PendingRead, StencilElem};
use crate::error::{Result, StencilError};
use crate::partition::PartitionedVector;
use log::trace;
use std::marker::PhantomData;

/// Halo buffers of one stencil instance.
///
/// Buffers are allocated once and refreshed on every [`exchange`](Self::exchange).
pub struct HaloExchange<T: StencilElem, D: Device = HostDevice> {
    lhalo: usize,
    rhalo: usize,
    staging: Vec<T>,
    device_halos: Vec<Buffer<T>>,
    _device: PhantomData<D>,
}

/// Reads issued for one partition in the read phase.
struct SlotReads<T> {
    left: Option<PendingRead<T>>,
    right: Option<PendingRead<T>>,
}

impl<T: StencilElem, D: Device> HaloExchange<T, D> {
    /// Allocates the halo buffers for `devices`.
    ///
    /// Device buffers hold at least one element so that a stencil without
    /// halo still has something to bind.
    pub fn new(devices: &[D], lhalo: usize, rhalo: usize) -> Result<Self> {
        let stride = lhalo + rhalo;
        let device_halos = devices
            .iter()
            .map(|dev| dev.alloc(stride.max(1)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            lhalo,
            rhalo,
            staging: vec![T::zero(); devices.len() * stride],
            device_halos,
            _device: PhantomData,
        })
    }

    pub fn lhalo(&self) -> usize {
        self.lhalo
    }

    pub fn rhalo(&self) -> usize {
        self.rhalo
    }

    /// Device halo buffer of partition `d`.
    pub fn buffer(&self, d: usize) -> &Buffer<T> {
        &self.device_halos[d]
    }

    /// Host staging slot of partition `d`, as of the last exchange.
    pub fn staged(&self, d: usize) -> &[T] {
        let stride = self.lhalo + self.rhalo;
        &self.staging[d * stride..(d + 1) * stride]
    }

    /// Refreshes every partition's halo from the current contents of `x`.
    pub fn exchange(&mut self, x: &PartitionedVector<T, D>) -> Result<()> {
        let devices = x.devices();
        let ndev = devices.len();
        let stride = self.lhalo + self.rhalo;

        if ndev != self.device_halos.len() {
            return Err(StencilError::LayoutMismatch(format!(
                "vector spans {} devices, halo buffers exist for {}",
                ndev,
                self.device_halos.len()
            )));
        }
        if ndev <= 1 || stride == 0 || x.is_empty() {
            return Ok(());
        }

        trace!("Halo exchange read phase over {} devices", ndev);
        let first = x.read_region(0, 1)?;
        let last = x.read_region(x.len() - 1, 1)?;
        let mut reads = Vec::with_capacity(ndev);
        for (d, part) in x.partitions().iter().enumerate() {
            if part.is_empty() || !self.uploads(d, ndev) {
                reads.push(None);
                continue;
            }

            let left = if self.lhalo > 0 && d > 0 {
                let begin = part.start.saturating_sub(self.lhalo);
                Some(x.read_region(begin, part.start - begin)?)
            } else {
                None
            };
            let right = if self.rhalo > 0 && d + 1 < ndev {
                let end = (part.end() + self.rhalo).min(x.len());
                Some(x.read_region(part.end(), end - part.end())?)
            } else {
                None
            };
            reads.push(Some(SlotReads { left, right }));
        }
        for dev in devices {
            dev.finish()?;
        }

        trace!("Halo exchange write phase over {} devices", ndev);
        let first = first.wait()?.first().copied().unwrap_or_else(T::zero);
        let last = last.wait()?.first().copied().unwrap_or_else(T::zero);
        for (d, slot_reads) in reads.into_iter().enumerate() {
            let Some(SlotReads { left, right }) = slot_reads else {
                continue;
            };
            let left = left.map(PendingRead::wait).transpose()?.unwrap_or_default();
            let right = right.map(PendingRead::wait).transpose()?.unwrap_or_default();

            let lhalo = self.lhalo;
            let slot = &mut self.staging[d * stride..(d + 1) * stride];
            fill_left(&mut slot[..lhalo], &left, first);
            fill_right(&mut slot[lhalo..], &right, last);

            devices[d].enqueue_write(&self.device_halos[d], 0, slot.to_vec())?;
        }
        for dev in devices {
            dev.finish()?;
        }

        Ok(())
    }

    /// Whether partition `d` reads anything from its halo buffer.
    fn uploads(&self, d: usize, ndev: usize) -> bool {
        (d > 0 && self.lhalo > 0) || (d + 1 < ndev && self.rhalo > 0)
    }
}

/// Right-aligns `data` in `slot` and replicates its first element (or `edge`
/// when empty) into the rest.
fn fill_left<T: StencilElem>(slot: &mut [T], data: &[T], edge: T) {
    let pad = slot.len() - data.len();
    slot[pad..].copy_from_slice(data);
    let fill = data.first().copied().unwrap_or(edge);
    slot[..pad].fill(fill);
}

/// Left-aligns `data` in `slot` and replicates its last element (or `edge`
/// when empty) into the rest.
fn fill_right<T: StencilElem>(slot: &mut [T], data: &[T], edge: T) {
    let n = data.len();
    slot[..n].copy_from_slice(data);
    let fill = data.last().copied().unwrap_or(edge);
    slot[n..].fill(fill);
}
