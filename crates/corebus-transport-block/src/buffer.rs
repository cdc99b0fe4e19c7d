//! Zero-copy buffer handles.
//!
//! [`TxBuffer`] wraps a claimed run of TX blocks; dropping it unsent
//! returns the blocks to the allocator, while sending or explicitly
//! dropping it through the façade consumes it. [`RxBuffer`] wraps a
//! received buffer in the remote side's channel; its lifetime past the
//! receive callback is governed by the hold/release protocol, not by the
//! handle itself.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::alloc::{Allocation, BlockAllocator};

/// A writable TX buffer claimed from the local allocator.
pub struct TxBuffer {
    data: NonNull<u8>,
    capacity: usize,
    index: usize,
    size: usize,
    alloc: Option<Arc<BlockAllocator>>,
}

// SAFETY: the handle owns its block run until sent or dropped; the data
// pointer stays valid for the transport instance's lifetime.
unsafe impl Send for TxBuffer {}

impl TxBuffer {
    pub(crate) fn new(a: Allocation, size: usize, alloc: Arc<BlockAllocator>) -> Self {
        Self {
            data: a.data,
            capacity: a.capacity,
            index: a.index,
            size,
            alloc: Some(alloc),
        }
    }

    /// Writable capacity of the claimed span, at least the requested size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Take ownership of the underlying blocks away from the handle so
    /// Drop no longer releases them. Returns (data, index, header size).
    pub(crate) fn defuse(mut self) -> (NonNull<u8>, usize, usize) {
        self.alloc = None;
        (self.data, self.index, self.size)
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        if let Some(alloc) = self.alloc.take() {
            let _ = alloc.release(self.index, self.size, None);
        }
    }
}

impl Deref for TxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the handle owns the span; capacity was derived from it.
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.capacity) }
    }
}

impl DerefMut for TxBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`; the handle is the unique writer.
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.capacity) }
    }
}

/// A received buffer in the remote side's channel.
///
/// Valid during the receive callback. To keep it longer, pass it to
/// `hold_rx_buffer` before the callback returns and hand it back through
/// `release_rx_buffer` when done; a buffer kept without a hold becomes
/// stale as soon as the callback returns.
pub struct RxBuffer {
    data: NonNull<u8>,
    len: usize,
}

// SAFETY: read-only view into the remote channel; validity is governed by
// the hold/release protocol, which is exactly what the type documents.
unsafe impl Send for RxBuffer {}

impl RxBuffer {
    pub(crate) fn new(data: NonNull<u8>, len: usize) -> Self {
        Self { data, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for RxBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the buffer was validated against the channel bounds
        // before the handle was built.
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BlockAllocator;
    use crate::layout::test_channel;
    use crate::Timeout;

    #[test]
    fn dropping_an_unsent_buffer_frees_its_blocks() {
        let mut backing = vec![0u64; 64];
        let alloc = Arc::new(BlockAllocator::new(test_channel(&mut backing, 64, 8)));

        let a = alloc.allocate(100, Timeout::NoWait).unwrap();
        let buf = TxBuffer::new(a, 100, Arc::clone(&alloc));
        assert_eq!(alloc.pool().count_set(), 2);
        drop(buf);
        assert_eq!(alloc.pool().count_set(), 0);
    }

    #[test]
    fn defused_buffers_do_not_release() {
        let mut backing = vec![0u64; 64];
        let alloc = Arc::new(BlockAllocator::new(test_channel(&mut backing, 64, 8)));

        let a = alloc.allocate(100, Timeout::NoWait).unwrap();
        let buf = TxBuffer::new(a, 100, Arc::clone(&alloc));
        let (_, index, size) = buf.defuse();
        assert_eq!(alloc.pool().count_set(), 2);
        alloc.release(index, size, None).unwrap();
        assert_eq!(alloc.pool().count_set(), 0);
    }

    #[test]
    fn tx_buffer_is_writable_up_to_capacity() {
        let mut backing = vec![0u64; 64];
        let alloc = Arc::new(BlockAllocator::new(test_channel(&mut backing, 64, 8)));

        let a = alloc.allocate(10, Timeout::NoWait).unwrap();
        let mut buf = TxBuffer::new(a, 10, Arc::clone(&alloc));
        assert_eq!(buf.capacity(), 60);
        buf[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }
}
