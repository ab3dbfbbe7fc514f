//! Device memory handles.
//!
//! A [`Buffer`] is a handle to memory owned by one device. Cloning the handle
//! does not copy the memory; all clones refer to the same allocation, which is
//! how queued commands keep the buffer alive while they wait to run.

use super::{DeviceError, Result, StencilElem};
use crossbeam::channel::Receiver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared handle to a device allocation of `len` elements.
#[derive(Debug, Clone)]
pub struct Buffer<T> {
    id: u64,
    data: Arc<RwLock<Vec<T>>>,
    len: usize,
}

impl<T: StencilElem> Buffer<T> {
    /// Wraps host memory as device memory.
    pub(crate) fn from_vec(data: Vec<T>) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            len: data.len(),
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether two handles refer to the same allocation.
    pub fn ptr_eq(&self, other: &Buffer<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Checks that `[offset, offset + len)` lies inside the buffer.
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DeviceError::OutOfRange {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>> {
        self.data
            .read()
            .map_err(|_| DeviceError::Poisoned("buffer read"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
        self.data
            .write()
            .map_err(|_| DeviceError::Poisoned("buffer write"))
    }

    /// Copy of the current contents.
    pub(crate) fn snapshot(&self) -> Result<Vec<T>> {
        Ok(self.read()?.clone())
    }
}

/// Result of an enqueued device-to-host read.
///
/// The data becomes available once the device queue reaches the read.
/// Several pending reads can be [joined](PendingRead::join) into one that
/// yields their concatenation, which is how a region spanning several
/// partitions is read.
#[derive(Debug)]
pub struct PendingRead<T> {
    pieces: Vec<Piece<T>>,
}

#[derive(Debug)]
enum Piece<T> {
    Ready(Vec<T>),
    Queued(Receiver<Result<Vec<T>>>),
}

impl<T: StencilElem> PendingRead<T> {
    /// A read whose data is already on the host.
    pub fn ready(data: Vec<T>) -> Self {
        Self {
            pieces: vec![Piece::Ready(data)],
        }
    }

    pub(crate) fn queued(rx: Receiver<Result<Vec<T>>>) -> Self {
        Self {
            pieces: vec![Piece::Queued(rx)],
        }
    }

    /// A read of nothing.
    pub fn empty() -> Self {
        Self { pieces: Vec::new() }
    }

    /// Appends `other` after this read.
    pub fn join(mut self, other: PendingRead<T>) -> Self {
        self.pieces.extend(other.pieces);
        self
    }

    /// Blocks until every piece has arrived and returns them concatenated.
    pub fn wait(self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for piece in self.pieces {
            match piece {
                Piece::Ready(data) => out.extend(data),
                Piece::Queued(rx) => {
                    let data = rx
                        .recv()
                        .map_err(|_| DeviceError::QueueClosed("pending read".to_string()))??;
                    out.extend(data);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    #[test]
    fn test_buffer_clones_share_memory() {
        let a = Buffer::from_vec(vec![1.0f32, 2.0]);
        let b = a.clone();
        b.write().unwrap()[0] = 5.0;
        assert_eq!(a.snapshot().unwrap(), vec![5.0, 2.0]);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.id(), b.id());

        let c = Buffer::from_vec(vec![1.0f32, 2.0]);
        assert!(!a.ptr_eq(&c));
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_check_range() {
        let buf = Buffer::from_vec(vec![0i32; 4]);
        assert!(buf.check_range(0, 4).is_ok());
        assert!(buf.check_range(4, 0).is_ok());
        assert!(matches!(
            buf.check_range(3, 2),
            Err(DeviceError::OutOfRange {
                offset: 3,
                len: 2,
                size: 4
            })
        ));
        assert!(buf.check_range(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_pending_read_join_order() {
        let (tx, rx) = bounded(1);
        let read = PendingRead::ready(vec![1, 2])
            .join(PendingRead::queued(rx))
            .join(PendingRead::empty())
            .join(PendingRead::ready(vec![5]));
        tx.send(Ok(vec![3, 4])).unwrap();
        assert_eq!(read.wait().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_pending_read_dropped_sender() {
        let (tx, rx) = bounded::<Result<Vec<f64>>>(1);
        drop(tx);
        let result = PendingRead::queued(rx).wait();
        assert!(matches!(result, Err(DeviceError::QueueClosed(_))));
    }
}
