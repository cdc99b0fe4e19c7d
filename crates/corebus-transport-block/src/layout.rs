//! Channel geometry and the block store.
//!
//! [`LinkConfig`] turns the raw shared-memory description (base addresses,
//! lengths, block counts) into validated [`Channel`] values at open time.
//! [`Channel`] is the only code allowed to convert between block indices
//! and data pointers; every conversion that involves data the remote side
//! may have written goes through its range validation first.

use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use corebus_core::{CacheOps, Error, Result};
use tracing::error;

/// Size of the per-buffer header: the payload length, stored in the first
/// block of the buffer.
pub const BLOCK_HEADER_SIZE: usize = core::mem::size_of::<u32>();

/// Wire block indices are a single byte.
const MAX_BLOCKS: usize = 256;

/// Description of one direction of the shared region.
///
/// The region is `[control-link area][block array]`; `ctrl_size` bytes at
/// `base` belong to the control link and are never touched by this crate.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Start of the whole channel region.
    pub base: *mut u8,
    /// Total region length in bytes.
    pub len: usize,
    /// Bytes at `base` reserved for the control link.
    pub ctrl_size: usize,
    /// Number of blocks to divide the remaining space into.
    pub block_count: usize,
}

/// Full geometry of one transport instance.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Locally owned direction: this side allocates and writes.
    pub tx: ChannelConfig,
    /// Remotely owned direction: this side only reads.
    pub rx: ChannelConfig,
    /// Data cache line size, or 0 on coherent targets. Must be a power of
    /// two when non-zero.
    pub cache_align: usize,
}

impl LinkConfig {
    /// Validate the geometry and build both channels.
    pub(crate) fn build(&self) -> Result<(Channel, Channel)> {
        let align = self.alignment()?;
        let tx = Channel::from_config(&self.tx, align)?;
        let rx = Channel::from_config(&self.rx, align)?;

        let tx_range = self.tx.base as usize..self.tx.base as usize + self.tx.len;
        let rx_range = self.rx.base as usize..self.rx.base as usize + self.rx.len;
        if tx_range.start < rx_range.end && rx_range.start < tx_range.end {
            return Err(Error::InvalidArgument("tx and rx regions overlap"));
        }

        Ok((tx, rx))
    }

    /// Block alignment: the larger of pointer size and the cache line.
    fn alignment(&self) -> Result<usize> {
        if self.cache_align != 0 && !self.cache_align.is_power_of_two() {
            return Err(Error::InvalidArgument("cache alignment not a power of two"));
        }
        Ok(self.cache_align.max(core::mem::size_of::<usize>()))
    }
}

/// One direction of the shared region, divided into blocks.
///
/// Immutable after construction; all accessors are pure address
/// arithmetic except the `validated_*` family, which range-checks
/// everything derived from remote-writable memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Channel {
    blocks: NonNull<u8>,
    block_size: usize,
    block_count: usize,
}

// SAFETY: Channel is a shape descriptor over a shared region that outlives
// the transport instance; the access protocol (local TX ownership, remote
// release messages) governs aliasing, not Rust references.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    fn from_config(cfg: &ChannelConfig, align: usize) -> Result<Self> {
        let base = NonNull::new(cfg.base)
            .ok_or(Error::InvalidArgument("channel base is null"))?;
        if (base.as_ptr() as usize) % align != 0 {
            return Err(Error::InvalidArgument("channel base misaligned"));
        }
        if cfg.block_count == 0 || cfg.block_count > MAX_BLOCKS {
            return Err(Error::InvalidArgument("block count out of range"));
        }

        let blocks_offset = cfg.ctrl_size.div_ceil(align) * align;
        let avail = cfg
            .len
            .checked_sub(blocks_offset)
            .ok_or(Error::InvalidArgument("control area exceeds region"))?;
        let block_size = (avail / cfg.block_count) / align * align;
        if block_size < align || block_size <= BLOCK_HEADER_SIZE {
            return Err(Error::InvalidArgument("region too small for block count"));
        }

        // SAFETY: blocks_offset <= cfg.len, checked above.
        let blocks = unsafe { NonNull::new_unchecked(base.as_ptr().add(blocks_offset)) };
        Ok(Self { blocks, block_size, block_count: cfg.block_count })
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn block_count(&self) -> usize {
        self.block_count
    }

    pub(crate) fn base(&self) -> *const u8 {
        self.blocks.as_ptr()
    }

    /// Largest payload one buffer can carry.
    pub(crate) fn max_alloc(&self) -> usize {
        self.block_size * self.block_count - BLOCK_HEADER_SIZE
    }

    /// Number of blocks a buffer of `payload` bytes spans.
    pub(crate) fn blocks_for(&self, payload: usize) -> usize {
        (payload + BLOCK_HEADER_SIZE).div_ceil(self.block_size)
    }

    /// Pointer to the start of a block. Pure arithmetic, no validation.
    pub(crate) fn block_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.block_count);
        // SAFETY: index is within the block array whenever the debug
        // assertion holds; callers validate wire-derived indices first.
        unsafe { self.blocks.as_ptr().add(index * self.block_size) }
    }

    /// Pointer to the data area of a block.
    pub(crate) fn data_ptr(&self, index: usize) -> NonNull<u8> {
        // SAFETY: block_ptr is non-null and the header offset stays inside
        // the block (block_size > BLOCK_HEADER_SIZE by construction).
        unsafe { NonNull::new_unchecked(self.block_ptr(index).add(BLOCK_HEADER_SIZE)) }
    }

    /// Store the payload size into the buffer header.
    pub(crate) fn write_header(&self, index: usize, size: u32) {
        // SAFETY: the header is word-aligned by construction and inside
        // the block array. Volatile, so the store is not elided or fused
        // with neighboring accesses to memory the remote side observes.
        unsafe { (self.block_ptr(index) as *mut u32).write_volatile(size) }
    }

    fn read_header(&self, index: usize) -> u32 {
        // SAFETY: as in `write_header`. Volatile, so the value is read
        // exactly once and the validated copy cannot be refetched.
        unsafe { (self.block_ptr(index) as *const u32).read_volatile() }
    }

    /// Resolve a block index to its data pointer, optionally reading and
    /// validating the buffer size stored in the header.
    ///
    /// With `want_size`, the header is (optionally cache-invalidated and)
    /// read once, then checked against the maximum allocable span before
    /// anything trusts it; with `invalidate` the payload range is
    /// invalidated afterwards as well. Nothing read from the shared region
    /// is used for address arithmetic before it passed these checks.
    pub(crate) fn validated_buffer(
        &self,
        index: usize,
        want_size: bool,
        invalidate: bool,
        cache: &dyn CacheOps,
    ) -> Result<(NonNull<u8>, Option<usize>)> {
        if index >= self.block_count {
            error!(index, "block index out of range");
            return Err(Error::InvalidArgument("block index out of range"));
        }
        let data = self.data_ptr(index);
        if !want_size {
            return Ok((data, None));
        }

        if invalidate {
            cache.invalidate(self.block_ptr(index), BLOCK_HEADER_SIZE);
            fence(Ordering::SeqCst);
        }
        let size = self.read_header(index) as usize;
        let allocable = self.block_size * self.block_count;
        let data_offset = index * self.block_size + BLOCK_HEADER_SIZE;
        if size > allocable - BLOCK_HEADER_SIZE || data_offset + size > allocable {
            error!(index, size, "corrupted buffer header");
            return Err(Error::InvalidArgument("corrupted buffer header"));
        }
        if invalidate {
            cache.invalidate(data.as_ptr(), size);
            fence(Ordering::SeqCst);
        }
        Ok((data, Some(size)))
    }

    /// [`Self::validated_buffer`] for callers that need the size.
    pub(crate) fn sized_buffer(
        &self,
        index: usize,
        invalidate: bool,
        cache: &dyn CacheOps,
    ) -> Result<(NonNull<u8>, usize)> {
        match self.validated_buffer(index, true, invalidate, cache)? {
            (data, Some(size)) => Ok((data, size)),
            (_, None) => Err(Error::InvalidArgument("corrupted buffer header")),
        }
    }

    /// [`Self::index_of`] for callers that need the size.
    pub(crate) fn sized_index_of(
        &self,
        ptr: *const u8,
        cache: &dyn CacheOps,
    ) -> Result<(usize, usize)> {
        match self.index_of(ptr, true, cache)? {
            (index, Some(size)) => Ok((index, size)),
            (_, None) => Err(Error::InvalidArgument("corrupted buffer header")),
        }
    }

    /// Inverse mapping: resolve a buffer data pointer back to its block
    /// index, with the same validation as [`Self::validated_buffer`].
    pub(crate) fn index_of(
        &self,
        ptr: *const u8,
        want_size: bool,
        cache: &dyn CacheOps,
    ) -> Result<(usize, Option<usize>)> {
        let base = self.blocks.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + self.block_size * self.block_count {
            error!("buffer pointer outside channel");
            return Err(Error::InvalidArgument("buffer pointer outside channel"));
        }
        let index = (addr - base) / self.block_size;
        let (expected, size) = self.validated_buffer(index, want_size, false, cache)?;
        if expected.as_ptr() as *const u8 != ptr {
            error!(index, "buffer pointer does not address a block data area");
            return Err(Error::InvalidArgument("pointer is not a buffer start"));
        }
        Ok((index, size))
    }
}

#[cfg(test)]
pub(crate) fn test_channel(backing: &mut Vec<u64>, block_size: usize, block_count: usize) -> Channel {
    assert_eq!(block_size % 8, 0);
    assert!(backing.len() * 8 >= block_size * block_count);
    Channel {
        blocks: NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap(),
        block_size,
        block_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corebus_core::Coherent;

    fn config(backing: &mut Vec<u64>, ctrl_size: usize, block_count: usize) -> ChannelConfig {
        ChannelConfig {
            base: backing.as_mut_ptr() as *mut u8,
            len: backing.len() * 8,
            ctrl_size,
            block_count,
        }
    }

    #[test]
    fn geometry_divides_remaining_space() {
        let mut backing = vec![0u64; 128]; // 1024 bytes
        let cfg = config(&mut backing, 100, 8);
        let ch = Channel::from_config(&cfg, 8).unwrap();
        // 104 bytes of control (rounded to 8), 920 left, 115 per block
        // rounded down to 112.
        assert_eq!(ch.block_size(), 112);
        assert_eq!(ch.block_count(), 8);
        assert_eq!(ch.max_alloc(), 112 * 8 - BLOCK_HEADER_SIZE);
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut backing = vec![0u64; 16];
        let small = Channel::from_config(&config(&mut backing, 0, 200), 8);
        assert_eq!(
            small.err(),
            Some(Error::InvalidArgument("region too small for block count"))
        );

        let zero = Channel::from_config(&config(&mut backing, 0, 0), 8);
        assert_eq!(zero.err(), Some(Error::InvalidArgument("block count out of range")));

        let huge_ctrl = Channel::from_config(&config(&mut backing, 4096, 2), 8);
        assert_eq!(
            huge_ctrl.err(),
            Some(Error::InvalidArgument("control area exceeds region"))
        );
    }

    #[test]
    fn rejects_overlapping_regions() {
        let mut backing = vec![0u64; 64];
        let cfg = LinkConfig {
            tx: config(&mut backing, 0, 4),
            rx: config(&mut backing, 0, 4),
            cache_align: 0,
        };
        assert!(matches!(
            cfg.build(),
            Err(Error::InvalidArgument("tx and rx regions overlap"))
        ));
    }

    #[test]
    fn header_round_trip() {
        let mut backing = vec![0u64; 64];
        let ch = test_channel(&mut backing, 64, 8);
        ch.write_header(3, 42);
        let (_, size) = ch.validated_buffer(3, true, false, &Coherent).unwrap();
        assert_eq!(size, Some(42));
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let mut backing = vec![0u64; 64];
        let ch = test_channel(&mut backing, 64, 8);
        // Larger than the whole allocable span.
        ch.write_header(0, (64 * 8) as u32);
        assert!(ch.validated_buffer(0, true, false, &Coherent).is_err());
        // Fits the span but runs past the channel end from its offset.
        ch.write_header(7, 61);
        assert!(ch.validated_buffer(7, true, false, &Coherent).is_err());
        // The same value is fine from block 0.
        ch.write_header(0, 61);
        assert!(ch.validated_buffer(0, true, false, &Coherent).is_ok());
    }

    #[test]
    fn index_out_of_range_is_rejected() {
        let mut backing = vec![0u64; 64];
        let ch = test_channel(&mut backing, 64, 8);
        assert!(ch.validated_buffer(8, false, false, &Coherent).is_err());
    }

    #[test]
    fn pointer_round_trip() {
        let mut backing = vec![0u64; 64];
        let ch = test_channel(&mut backing, 64, 8);
        ch.write_header(5, 10);
        let (data, _) = ch.validated_buffer(5, true, false, &Coherent).unwrap();
        let (index, size) = ch.index_of(data.as_ptr(), true, &Coherent).unwrap();
        assert_eq!(index, 5);
        assert_eq!(size, Some(10));
    }

    #[test]
    fn stray_pointers_are_rejected() {
        let mut backing = vec![0u64; 64];
        let ch = test_channel(&mut backing, 64, 8);
        // Mid-block pointer.
        let mid = unsafe { ch.block_ptr(2).add(BLOCK_HEADER_SIZE + 1) };
        assert!(ch.index_of(mid, false, &Coherent).is_err());
        // Outside the channel entirely.
        let outside = unsafe { ch.block_ptr(0).sub(1) };
        assert!(ch.index_of(outside, false, &Coherent).is_err());
    }

    #[test]
    fn blocks_for_matches_span_arithmetic() {
        let mut backing = vec![0u64; 64];
        let ch = test_channel(&mut backing, 64, 8);
        assert_eq!(ch.blocks_for(0), 1);
        assert_eq!(ch.blocks_for(60), 1);
        assert_eq!(ch.blocks_for(61), 2);
        assert_eq!(ch.blocks_for(100), 2);
        assert_eq!(ch.blocks_for(200), 4);
    }
}
