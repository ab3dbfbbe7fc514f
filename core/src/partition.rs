//! Vectors partitioned across devices.
//!
//! # Layout
//!
//! A [`PartitionedVector`] of length `len` over `n` devices splits `[0, len)`
//! into `n` ordered, contiguous, non-overlapping [`Partition`]s. Partition `d`
//! lives entirely in a buffer on device `d`. Partitions may be empty, which
//! happens naturally when a vector is shorter than the device list.
//!
//! ```text
//!   global  | 0 1 2 3 | 4 5 6 | 7 8 9 |
//!   device  |    0    |   1   |   2   |
//! ```

use crate::device::{Buffer, Device, HostDevice, PendingRead, StencilElem};
use crate::error::{Result, StencilError};
use std::ops::Range;

/// A half-open range `[start, start + size)` of a partitioned vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: usize,
    pub size: usize,
}

impl Partition {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Splits `[0, len)` into `n` partitions of near-equal size.
pub fn even_partitions(len: usize, n: usize) -> Vec<Partition> {
    (0..n)
        .map(|d| {
            let start = len * d / n;
            let end = len * (d + 1) / n;
            Partition {
                start,
                size: end - start,
            }
        })
        .collect()
}

/// Lays out partitions of the given sizes back to back.
pub fn partitions_from_sizes(sizes: &[usize]) -> Vec<Partition> {
    let mut start = 0;
    sizes
        .iter()
        .map(|&size| {
            let part = Partition { start, size };
            start += size;
            part
        })
        .collect()
}

/// A vector whose elements are spread over several devices.
pub struct PartitionedVector<T: StencilElem, D: Device = HostDevice> {
    devices: Vec<D>,
    parts: Vec<Partition>,
    buffers: Vec<Buffer<T>>,
    len: usize,
}

impl<T: StencilElem, D: Device> PartitionedVector<T, D> {
    fn allocate(devices: &[D], parts: Vec<Partition>, len: usize) -> Result<Self> {
        if devices.is_empty() || parts.len() != devices.len() {
            return Err(StencilError::Partition {
                sizes: parts.iter().map(|p| p.size).collect(),
                len,
            });
        }
        let buffers = devices
            .iter()
            .zip(&parts)
            .map(|(dev, part)| dev.alloc(part.size))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            devices: devices.to_vec(),
            parts,
            buffers,
            len,
        })
    }

    /// A zero-filled vector of `len` elements, split evenly over `devices`.
    pub fn zeros(devices: &[D], len: usize) -> Result<Self> {
        Self::allocate(devices, even_partitions(len, devices.len()), len)
    }

    /// A zero-filled vector with explicit partition sizes.
    pub fn zeros_with_sizes(devices: &[D], sizes: &[usize]) -> Result<Self> {
        let len = sizes.iter().sum();
        Self::allocate(devices, partitions_from_sizes(sizes), len)
    }

    /// A zero-filled vector laid out exactly like `other`.
    pub fn zeros_like<U: StencilElem>(other: &PartitionedVector<U, D>) -> Result<Self> {
        Self::allocate(&other.devices, other.parts.clone(), other.len)
    }

    /// Copies `data` to `devices`, split evenly.
    pub fn from_slice(devices: &[D], data: &[T]) -> Result<Self> {
        let v = Self::zeros(devices, data.len())?;
        v.write(data)?;
        Ok(v)
    }

    /// Copies `data` to `devices` with explicit partition sizes.
    pub fn from_slice_with_sizes(devices: &[D], data: &[T], sizes: &[usize]) -> Result<Self> {
        if sizes.iter().sum::<usize>() != data.len() {
            return Err(StencilError::Partition {
                sizes: sizes.to_vec(),
                len: data.len(),
            });
        }
        let v = Self::zeros_with_sizes(devices, sizes)?;
        v.write(data)?;
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.parts
    }

    /// Global offset of the first element on device `d`.
    pub fn part_start(&self, d: usize) -> usize {
        self.parts[d].start
    }

    /// Number of elements on device `d`.
    pub fn part_size(&self, d: usize) -> usize {
        self.parts[d].size
    }

    /// Buffer holding the partition of device `d`.
    pub fn buffer(&self, d: usize) -> &Buffer<T> {
        &self.buffers[d]
    }

    /// Whether `other` has the same devices and partition boundaries.
    pub fn same_layout<U: StencilElem>(&self, other: &PartitionedVector<U, D>) -> bool {
        self.devices == other.devices && self.parts == other.parts
    }

    /// Enqueues reads of `[begin, begin + len)`.
    ///
    /// The region may span several partitions; one read is issued on each
    /// device that owns part of it, and the returned [`PendingRead`] yields
    /// the elements in global order.
    pub fn read_region(&self, begin: usize, len: usize) -> Result<PendingRead<T>> {
        let end = begin
            .checked_add(len)
            .filter(|&end| end <= self.len)
            .ok_or(StencilError::OutOfRange {
                offset: begin,
                len,
                size: self.len,
            })?;

        let mut pending = PendingRead::empty();
        for (d, part) in self.parts.iter().enumerate() {
            let lo = begin.max(part.start);
            let hi = end.min(part.end());
            if lo < hi {
                let read =
                    self.devices[d].enqueue_read(&self.buffers[d], lo - part.start, hi - lo)?;
                pending = pending.join(read);
            }
        }
        Ok(pending)
    }

    /// Copies the whole vector back to the host.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.read_region(0, self.len)?.wait()?)
    }

    /// Enqueues a copy of `data` into the vector.
    pub fn write(&self, data: &[T]) -> Result<()> {
        if data.len() != self.len {
            return Err(StencilError::OutOfRange {
                offset: 0,
                len: data.len(),
                size: self.len,
            });
        }
        for (d, part) in self.parts.iter().enumerate() {
            if !part.is_empty() {
                self.devices[d].enqueue_write(&self.buffers[d], 0, data[part.range()].to_vec())?;
            }
        }
        Ok(())
    }

    /// A new vector with the same layout and contents.
    pub fn duplicate(&self) -> Result<Self> {
        let copy = Self::zeros_like(self)?;
        copy.write(&self.to_vec()?)?;
        Ok(copy)
    }
}

impl<T: StencilElem, D: Device> std::fmt::Debug for PartitionedVector<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedVector")
            .field("len", &self.len)
            .field("partitions", &self.parts)
            .finish()
    }
}
