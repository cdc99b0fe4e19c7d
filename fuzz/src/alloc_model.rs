//! In-memory model of the block allocator for property-based testing.
//!
//! Replicates the allocation algorithm (first-fit contiguous runs, greedy
//! zero-size mode, release with optional shrink) on a plain `Vec<bool>`
//! bitmap so operation sequences can be fuzzed without shared memory.

use std::collections::BTreeMap;

/// Minimum block count for fuzzing.
pub const MIN_BLOCKS: usize = 2;
/// Maximum block count for fuzzing (small pools find edge cases faster).
pub const MAX_BLOCKS: usize = 32;
/// Block size used by the model, matching the reference test geometry.
pub const BLOCK_SIZE: usize = 64;
/// Size of the per-buffer header.
pub const HEADER_SIZE: usize = 4;

/// A live buffer: first block, span, and the size recorded in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub start: usize,
    pub blocks: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No contiguous run of the required length.
    NoSpace,
    /// The request can never fit the channel.
    TooBig,
    /// Shrink target needs more blocks than the buffer holds.
    Grow,
}

/// Bitmap model of the allocator.
pub struct AllocModel {
    bits: Vec<bool>,
}

impl AllocModel {
    pub fn new(block_count: usize) -> Self {
        let block_count = block_count.clamp(MIN_BLOCKS, MAX_BLOCKS);
        Self { bits: vec![false; block_count] }
    }

    pub fn block_count(&self) -> usize {
        self.bits.len()
    }

    pub fn max_alloc(&self) -> usize {
        self.bits.len() * BLOCK_SIZE - HEADER_SIZE
    }

    pub fn blocks_for(size: usize) -> usize {
        (size + HEADER_SIZE).div_ceil(BLOCK_SIZE)
    }

    pub fn set_count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Whether a run of `blocks` clear bits exists anywhere.
    pub fn has_run(&self, blocks: usize) -> bool {
        let mut free = 0;
        for &bit in &self.bits {
            free = if bit { 0 } else { free + 1 };
            if free >= blocks {
                return true;
            }
        }
        false
    }

    /// Allocate a buffer; `size == 0` is the greedy mode.
    pub fn alloc(&mut self, size: usize) -> Result<BufferHandle, AllocError> {
        if size > self.max_alloc() {
            return Err(AllocError::TooBig);
        }
        if size == 0 {
            return self.alloc_greedy();
        }
        let blocks = Self::blocks_for(size);
        let mut start = 0;
        while start + blocks <= self.bits.len() {
            match self.bits[start..start + blocks].iter().position(|&b| b) {
                Some(used) => start += used + 1,
                None => {
                    self.bits[start..start + blocks].iter_mut().for_each(|b| *b = true);
                    return Ok(BufferHandle { start, blocks, size });
                }
            }
        }
        Err(AllocError::NoSpace)
    }

    fn alloc_greedy(&mut self) -> Result<BufferHandle, AllocError> {
        let start = self.bits.iter().position(|&b| !b).ok_or(AllocError::NoSpace)?;
        let mut blocks = 0;
        while start + blocks < self.bits.len() && !self.bits[start + blocks] {
            self.bits[start + blocks] = true;
            blocks += 1;
        }
        let size = blocks * BLOCK_SIZE - HEADER_SIZE;
        Ok(BufferHandle { start, blocks, size })
    }

    /// Release a buffer, or shrink it to `shrink_to` bytes and free only
    /// the excess trailing blocks. Returns the surviving handle, if any.
    pub fn release(
        &mut self,
        handle: BufferHandle,
        shrink_to: Option<usize>,
    ) -> Result<Option<BufferHandle>, AllocError> {
        let (free_start, free_count, kept) = match shrink_to {
            None => (handle.start, handle.blocks, None),
            Some(new_size) => {
                let keep = Self::blocks_for(new_size);
                if keep > handle.blocks {
                    return Err(AllocError::Grow);
                }
                (
                    handle.start + keep,
                    handle.blocks - keep,
                    Some(BufferHandle { start: handle.start, blocks: keep, size: new_size }),
                )
            }
        };
        for bit in &mut self.bits[free_start..free_start + free_count] {
            assert!(*bit, "releasing a block that was not allocated");
            *bit = false;
        }
        Ok(kept)
    }
}

/// Operations the fuzzer drives.
#[derive(Clone, Debug)]
pub enum AllocOp {
    /// Allocate `size % (max_alloc * 5 / 4)` bytes, so a share of the
    /// requests intentionally exceed the channel.
    Alloc { size: u16 },
    /// Greedy zero-size allocation.
    AllocGreedy,
    /// Release the n-th live buffer.
    Release { which: u8 },
    /// Shrink the n-th live buffer to `new_size % (size + blocksize)`.
    Shrink { which: u8, new_size: u16 },
}

/// Execute a sequence of operations, verifying invariants after each.
pub fn execute_and_verify(block_count: usize, ops: &[AllocOp]) -> Result<(), String> {
    let mut model = AllocModel::new(block_count);
    let mut live: BTreeMap<usize, BufferHandle> = BTreeMap::new();

    for (i, op) in ops.iter().enumerate() {
        match op {
            AllocOp::Alloc { size } => {
                let size = (*size as usize) % (model.max_alloc() * 5 / 4).max(1);
                let fits = size <= model.max_alloc();
                let had_run = fits && model.has_run(AllocModel::blocks_for(size));
                match model.alloc(size) {
                    Ok(handle) => {
                        if !fits {
                            return Err(format!("op {i}: oversized alloc succeeded"));
                        }
                        if live.insert(handle.start, handle).is_some() {
                            return Err(format!("op {i}: duplicate start {}", handle.start));
                        }
                    }
                    Err(AllocError::TooBig) => {
                        if fits {
                            return Err(format!("op {i}: fitting request reported TooBig"));
                        }
                    }
                    Err(AllocError::NoSpace) => {
                        if had_run {
                            return Err(format!(
                                "op {i}: NoSpace with a fitting run available"
                            ));
                        }
                    }
                    Err(e) => return Err(format!("op {i}: unexpected error {e:?}")),
                }
            }
            AllocOp::AllocGreedy => {
                let any_free = model.has_run(1);
                match model.alloc(0) {
                    Ok(handle) => {
                        // Greedy takes the first free bit and every free
                        // bit after it: no free bit before the start, and
                        // the bit after the run (if any) is occupied.
                        if (0..handle.start).any(|b| !model.bits[b]) {
                            return Err(format!("op {i}: greedy skipped a free bit"));
                        }
                        let end = handle.start + handle.blocks;
                        if end < model.block_count() && !model.bits[end] {
                            return Err(format!("op {i}: greedy stopped short"));
                        }
                        live.insert(handle.start, handle);
                    }
                    Err(AllocError::NoSpace) => {
                        if any_free {
                            return Err(format!("op {i}: greedy NoSpace with free bits"));
                        }
                    }
                    Err(e) => return Err(format!("op {i}: unexpected error {e:?}")),
                }
            }
            AllocOp::Release { which } => {
                let Some(&start) = live.keys().nth(*which as usize % live.len().max(1)) else {
                    continue;
                };
                let handle = live.remove(&start).unwrap();
                model
                    .release(handle, None)
                    .map_err(|e| format!("op {i}: release failed {e:?}"))?;
            }
            AllocOp::Shrink { which, new_size } => {
                let Some(&start) = live.keys().nth(*which as usize % live.len().max(1)) else {
                    continue;
                };
                let handle = live[&start];
                let new_size = (*new_size as usize) % (handle.size + BLOCK_SIZE);
                match model.release(handle, Some(new_size)) {
                    Ok(kept) => {
                        live.remove(&start);
                        if let Some(kept) = kept {
                            live.insert(kept.start, kept);
                        }
                    }
                    Err(AllocError::Grow) => {
                        if AllocModel::blocks_for(new_size) <= handle.blocks {
                            return Err(format!("op {i}: valid shrink rejected"));
                        }
                    }
                    Err(e) => return Err(format!("op {i}: unexpected error {e:?}")),
                }
            }
        }

        verify_invariants(&model, &live, i)?;
    }

    Ok(())
}

fn verify_invariants(
    model: &AllocModel,
    live: &BTreeMap<usize, BufferHandle>,
    op_idx: usize,
) -> Result<(), String> {
    // Conservation: set bits equal the blocks held by live buffers.
    let held: usize = live.values().map(|h| h.blocks).sum();
    if model.set_count() != held {
        return Err(format!(
            "after op {op_idx}: {} bits set but {held} blocks held",
            model.set_count()
        ));
    }

    // Live buffers are disjoint and every spanned bit is set.
    let mut prev_end = 0;
    for handle in live.values() {
        if handle.start < prev_end {
            return Err(format!("after op {op_idx}: overlapping buffers"));
        }
        prev_end = handle.start + handle.blocks;
        for b in handle.start..prev_end {
            if !model.bits[b] {
                return Err(format!("after op {op_idx}: live buffer over a clear bit {b}"));
            }
        }
        // Header size always fits the span.
        if AllocModel::blocks_for(handle.size) > handle.blocks {
            return Err(format!("after op {op_idx}: header size exceeds span"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_geometry_block_counts() {
        // block_size 64, header 4: the worked example from the design.
        assert_eq!(AllocModel::blocks_for(100), 2);
        assert_eq!(AllocModel::blocks_for(200), 4);
        assert_eq!(AllocModel::blocks_for(60), 1);
        assert_eq!(AllocModel::blocks_for(0), 1);
    }

    #[test]
    fn alloc_release_conserves_bits() {
        let mut model = AllocModel::new(8);
        let a = model.alloc(100).unwrap();
        let b = model.alloc(200).unwrap();
        assert_eq!(model.set_count(), 6);
        model.release(a, None).unwrap();
        model.release(b, None).unwrap();
        assert_eq!(model.set_count(), 0);
    }

    #[test]
    fn four_block_request_with_three_free_fails() {
        let mut model = AllocModel::new(8);
        model.alloc(300).unwrap(); // 5 blocks
        assert_eq!(model.alloc(200), Err(AllocError::NoSpace));
    }

    #[test]
    fn shrink_to_same_block_count_frees_nothing() {
        let mut model = AllocModel::new(8);
        let a = model.alloc(100).unwrap();
        let kept = model.release(a, Some(100)).unwrap().unwrap();
        assert_eq!(kept.blocks, a.blocks);
        assert_eq!(model.set_count(), 2);
    }

    #[test]
    fn mixed_sequence_holds_invariants() {
        let ops = vec![
            AllocOp::Alloc { size: 100 },
            AllocOp::Alloc { size: 200 },
            AllocOp::AllocGreedy,
            AllocOp::Release { which: 1 },
            AllocOp::Shrink { which: 0, new_size: 10 },
            AllocOp::Alloc { size: 60 },
            AllocOp::Release { which: 0 },
            AllocOp::Release { which: 0 },
            AllocOp::Release { which: 0 },
        ];
        execute_and_verify(8, &ops).unwrap();
    }

    #[test]
    fn greedy_takes_the_first_gap_whole() {
        let mut model = AllocModel::new(8);
        let a = model.alloc(100).unwrap(); // blocks 0..2
        let _b = model.alloc(300).unwrap(); // blocks 2..7
        model.release(a, None).unwrap();

        let g = model.alloc(0).unwrap();
        assert_eq!((g.start, g.blocks), (0, 2));
        assert_eq!(g.size, 2 * BLOCK_SIZE - HEADER_SIZE);
    }
}
