//! Variable-length buffer allocation over the TX block bitmap.
//!
//! Allocation claims a contiguous run of blocks through the bit pool and
//! never holds a lock around application logic; the mutex below exists
//! only to pair with the condvar for the blocking retry loop. Every
//! release notifies the condvar, so waiters re-try whenever any space
//! comes back.

use std::ptr::NonNull;
use std::time::Instant;

use corebus_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::bitpool::BitPool;
use crate::layout::{Channel, BLOCK_HEADER_SIZE};
use crate::Timeout;

/// A claimed buffer: index of its first block, data pointer, capacity.
#[derive(Debug, PartialEq)]
pub(crate) struct Allocation {
    pub index: usize,
    pub data: NonNull<u8>,
    pub capacity: usize,
}

// SAFETY: mirrors the Send impls for the other NonNull-bearing types in this
// crate (TxBuffer, RxBuffer, Channel); the pointer addresses a shared region
// whose synchronization is handled by the allocator.
unsafe impl Send for Allocation {}

pub(crate) struct BlockAllocator {
    channel: Channel,
    pool: BitPool,
    wait: Mutex<()>,
    freed: Condvar,
}

impl BlockAllocator {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            pool: BitPool::new(channel.block_count()),
            channel,
            wait: Mutex::new(()),
            freed: Condvar::new(),
        }
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// `size == 0` selects the greedy mode: claim the first free block and
    /// every free block directly after it. That mode is reserved for the
    /// bound-message path; the public API never passes zero.
    ///
    /// The requested size is written into the buffer header; the returned
    /// capacity covers the whole claimed span and is at least `size`.
    pub(crate) fn allocate(&self, size: usize, timeout: Timeout) -> Result<Allocation> {
        if size > self.channel.max_alloc() {
            return Err(Error::NoMem);
        }
        if let Some(claim) = self.try_claim(size) {
            return Ok(self.finish(size, claim));
        }
        let deadline = match timeout {
            Timeout::NoWait => return Err(Error::NoMem),
            Timeout::Forever => None,
            Timeout::After(d) => Some(Instant::now() + d),
        };

        let mut guard = self.wait.lock();
        loop {
            if let Some(claim) = self.try_claim(size) {
                drop(guard);
                return Ok(self.finish(size, claim));
            }
            match deadline {
                None => self.freed.wait(&mut guard),
                Some(deadline) => {
                    if self.freed.wait_until(&mut guard, deadline).timed_out() {
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
    }

    fn try_claim(&self, size: usize) -> Option<(usize, usize)> {
        if size == 0 {
            self.pool.claim_any()
        } else {
            let blocks = self.channel.blocks_for(size);
            self.pool.claim_run(blocks).map(|start| (start, blocks))
        }
    }

    fn finish(&self, size: usize, (start, blocks): (usize, usize)) -> Allocation {
        let capacity = blocks * self.channel.block_size() - BLOCK_HEADER_SIZE;
        let header = if size > 0 { size } else { capacity };
        self.channel.write_header(start, header as u32);
        Allocation { index: start, data: self.channel.data_ptr(start), capacity }
    }

    /// Release the blocks spanned by a buffer of `size` bytes starting at
    /// `index`.
    ///
    /// With `shrink_to`, the buffer is reduced to the new size instead:
    /// the header is rewritten and only the now-excess trailing blocks are
    /// freed. Shrinking to a size that spans the same number of blocks
    /// frees nothing and leaves the bitmap unchanged.
    pub(crate) fn release(
        &self,
        index: usize,
        size: usize,
        shrink_to: Option<usize>,
    ) -> Result<usize> {
        let blocks = self.channel.blocks_for(size);
        let (free_start, free_count) = match shrink_to {
            None => (index, blocks),
            Some(new_size) => {
                let keep = self.channel.blocks_for(new_size);
                if keep > blocks {
                    error!(size, new_size, "buffer cannot grow on release");
                    return Err(Error::InvalidArgument("shrink size exceeds allocation"));
                }
                self.channel.write_header(index, new_size as u32);
                (index + keep, blocks - keep)
            }
        };

        if free_count > 0 {
            self.pool.clear_range(free_start, free_count);
            // Lock/unlock pairs with the allocate loop so a claimer that
            // just failed cannot miss this wakeup.
            drop(self.wait.lock());
            self.freed.notify_all();
        }
        Ok(index)
    }

    pub(crate) fn max_alloc(&self) -> usize {
        self.channel.max_alloc()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &BitPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::test_channel;
    use corebus_core::Coherent;
    use std::sync::Arc;
    use std::time::Duration;

    fn allocator(backing: &mut Vec<u64>) -> BlockAllocator {
        // block_size 64, 8 blocks, 4-byte header: the reference geometry.
        BlockAllocator::new(test_channel(backing, 64, 8))
    }

    #[test]
    fn allocation_spans_the_expected_blocks() {
        let mut backing = vec![0u64; 64];
        let alloc = allocator(&mut backing);

        // ceil((100 + 4) / 64) = 2 blocks.
        let a = alloc.allocate(100, Timeout::NoWait).unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(a.capacity, 2 * 64 - 4);
        assert_eq!(alloc.pool().count_set(), 2);

        // ceil((200 + 4) / 64) = 4 blocks.
        let b = alloc.allocate(200, Timeout::NoWait).unwrap();
        assert_eq!(b.index, 2);
        assert_eq!(alloc.pool().count_set(), 6);
    }

    #[test]
    fn header_carries_the_requested_size() {
        let mut backing = vec![0u64; 64];
        let channel = test_channel(&mut backing, 64, 8);
        let alloc = BlockAllocator::new(channel);

        let a = alloc.allocate(100, Timeout::NoWait).unwrap();
        let (_, size) = channel.validated_buffer(a.index, true, false, &Coherent).unwrap();
        assert_eq!(size, Some(100));
    }

    #[test]
    fn greedy_mode_takes_all_adjacent_space() {
        let mut backing = vec![0u64; 64];
        let channel = test_channel(&mut backing, 64, 8);
        let alloc = BlockAllocator::new(channel);

        // Occupy blocks 3..4 so the greedy claim stops there.
        let fixed = alloc.allocate(100, Timeout::NoWait).unwrap();
        assert_eq!(fixed.index, 0);
        let barrier = alloc.allocate(60, Timeout::NoWait).unwrap();
        assert_eq!(barrier.index, 2);
        alloc.release(fixed.index, 100, None).unwrap();

        let greedy = alloc.allocate(0, Timeout::NoWait).unwrap();
        assert_eq!(greedy.index, 0);
        assert_eq!(greedy.capacity, 2 * 64 - 4);
        let (_, size) = channel.validated_buffer(0, true, false, &Coherent).unwrap();
        assert_eq!(size, Some(greedy.capacity));
    }

    #[test]
    fn no_wait_exhaustion_is_nomem() {
        let mut backing = vec![0u64; 64];
        let alloc = allocator(&mut backing);
        alloc.allocate(300, Timeout::NoWait).unwrap(); // 5 blocks
        // 4 blocks needed, 3 free.
        assert_eq!(alloc.allocate(200, Timeout::NoWait), Err(Error::NoMem));
    }

    #[test]
    fn oversized_request_is_nomem_even_when_empty() {
        let mut backing = vec![0u64; 64];
        let alloc = allocator(&mut backing);
        assert_eq!(alloc.allocate(64 * 8, Timeout::NoWait), Err(Error::NoMem));
    }

    #[test]
    fn timed_wait_expires_without_side_effects() {
        let mut backing = vec![0u64; 64];
        let alloc = allocator(&mut backing);
        alloc.allocate(400, Timeout::NoWait).unwrap(); // 7 blocks
        let before = alloc.pool().count_set();
        assert_eq!(
            alloc.allocate(200, Timeout::After(Duration::from_millis(50))),
            Err(Error::TimedOut)
        );
        assert_eq!(alloc.pool().count_set(), before);
    }

    #[test]
    fn release_wakes_a_blocked_allocator() {
        let mut backing = vec![0u64; 64];
        let alloc = Arc::new(allocator(&mut backing));
        let first = alloc.allocate(300, Timeout::NoWait).unwrap(); // 5 blocks
        alloc.allocate(120, Timeout::NoWait).unwrap(); // 2 blocks, 1 left

        let waiter = {
            let alloc = Arc::clone(&alloc);
            std::thread::spawn(move || alloc.allocate(200, Timeout::After(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        alloc.release(first.index, 300, None).unwrap();

        let a = waiter.join().unwrap().unwrap();
        assert_eq!(a.capacity, 4 * 64 - 4);
    }

    #[test]
    fn shrink_frees_only_excess_blocks() {
        let mut backing = vec![0u64; 64];
        let channel = test_channel(&mut backing, 64, 8);
        let alloc = BlockAllocator::new(channel);

        let a = alloc.allocate(200, Timeout::NoWait).unwrap(); // 4 blocks
        alloc.release(a.index, 200, Some(100)).unwrap(); // keep 2
        assert_eq!(alloc.pool().count_set(), 2);
        let (_, size) = channel.validated_buffer(a.index, true, false, &Coherent).unwrap();
        assert_eq!(size, Some(100));
    }

    #[test]
    fn shrink_to_same_size_is_idempotent() {
        let mut backing = vec![0u64; 64];
        let alloc = allocator(&mut backing);
        let a = alloc.allocate(100, Timeout::NoWait).unwrap();
        let before = alloc.pool().count_set();
        alloc.release(a.index, 100, Some(100)).unwrap();
        assert_eq!(alloc.pool().count_set(), before);
    }

    #[test]
    fn shrink_cannot_grow() {
        let mut backing = vec![0u64; 64];
        let alloc = allocator(&mut backing);
        let a = alloc.allocate(100, Timeout::NoWait).unwrap();
        assert!(alloc.release(a.index, 100, Some(300)).is_err());
    }

    #[test]
    fn balanced_sequences_conserve_the_bitmap() {
        let mut backing = vec![0u64; 64];
        let alloc = allocator(&mut backing);
        let a = alloc.allocate(10, Timeout::NoWait).unwrap();
        let b = alloc.allocate(100, Timeout::NoWait).unwrap();
        let c = alloc.allocate(60, Timeout::NoWait).unwrap();
        assert_eq!(alloc.pool().count_set(), 1 + 2 + 1);
        alloc.release(b.index, 100, None).unwrap();
        assert_eq!(alloc.pool().count_set(), 2);
        alloc.release(a.index, 10, None).unwrap();
        alloc.release(c.index, 60, None).unwrap();
        assert_eq!(alloc.pool().count_set(), 0);
    }
}
