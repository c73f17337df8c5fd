//! Block table: per-sequence logical→physical mapping.
//!
//! Each active sequence owns an ordered list of block IDs; entry `k` covers
//! logical positions `[k·block_size, (k+1)·block_size)`. Translation uses
//!
//! ```text
//! physical_cell = blocks[pos / block_size] * block_size + pos % block_size
//! ```
//!
//! which is deliberately the same arithmetic the attention kernels use to
//! address the KV tensor, so the table and the kernels agree bit-exactly.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::cache::allocator::{AllocError, BlockAllocator, BlockId};

/// Externally supplied identifier for one KV-cache consumer.
pub type SeqId = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    #[error("unknown sequence {0}")]
    UnknownSequence(SeqId),

    #[error("position {pos} out of range for sequence {seq}")]
    PositionOutOfRange { seq: SeqId, pos: usize },

    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Outcome of [`BlockTable::prepare_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowWrite {
    /// Block the write should land in.
    pub block_id: BlockId,

    /// When the covering block was shared, the block whose cells must be
    /// copied into `block_id` before writing.
    pub copied_from: Option<BlockId>,
}

/// Maps logical token positions to scattered physical blocks, per sequence.
#[derive(Debug, Default)]
pub struct BlockTable {
    block_size: usize,

    /// seq_id → physical block IDs in logical order.
    tables: HashMap<SeqId, Vec<BlockId>>,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block_size must be > 0");
        Self {
            block_size,
            tables: HashMap::new(),
        }
    }

    /// Tokens per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Translate a logical position to the physical cell index used by
    /// attention kernels.
    pub fn logical_to_physical(&self, seq: SeqId, pos: usize) -> Result<usize, TableError> {
        let blocks = self
            .tables
            .get(&seq)
            .ok_or(TableError::UnknownSequence(seq))?;

        let logical_block = pos / self.block_size;
        let block_id = *blocks
            .get(logical_block)
            .ok_or(TableError::PositionOutOfRange { seq, pos })?;

        Ok(block_id as usize * self.block_size + pos % self.block_size)
    }

    /// Append a block to a sequence's list, creating the list if absent.
    ///
    /// The block's initial reference (set by `allocate`) is handed over to
    /// the table here; ref counts are not touched.
    pub fn append_block(&mut self, seq: SeqId, block_id: BlockId) {
        self.tables.entry(seq).or_default().push(block_id);
    }

    /// True when storing `new_total_tokens` tokens exceeds current capacity.
    pub fn needs_new_block(&self, seq: SeqId, new_total_tokens: usize) -> bool {
        new_total_tokens > self.capacity(seq)
    }

    /// Current capacity in tokens; 0 for unknown sequences.
    pub fn capacity(&self, seq: SeqId) -> usize {
        self.num_blocks_for(seq) * self.block_size
    }

    /// Number of blocks held by a sequence; 0 for unknown sequences.
    pub fn num_blocks_for(&self, seq: SeqId) -> usize {
        self.tables.get(&seq).map_or(0, Vec::len)
    }

    /// Whether the sequence has any mapping.
    pub fn has_seq(&self, seq: SeqId) -> bool {
        self.tables.contains_key(&seq)
    }

    /// Physical block covering a logical position.
    pub fn get_block_id(&self, seq: SeqId, pos: usize) -> Result<BlockId, TableError> {
        let blocks = self
            .tables
            .get(&seq)
            .ok_or(TableError::UnknownSequence(seq))?;

        blocks
            .get(pos / self.block_size)
            .copied()
            .ok_or(TableError::PositionOutOfRange { seq, pos })
    }

    /// Install `new_block` at a logical index, replacing the previous entry.
    ///
    /// The caller owns the ref-count bookkeeping on both blocks; this is the
    /// raw install step of the CoW write path.
    pub fn replace_block(
        &mut self,
        seq: SeqId,
        logical_idx: usize,
        new_block: BlockId,
    ) -> Result<(), TableError> {
        let blocks = self
            .tables
            .get_mut(&seq)
            .ok_or(TableError::UnknownSequence(seq))?;

        let slot = blocks
            .get_mut(logical_idx)
            .ok_or(TableError::PositionOutOfRange {
                seq,
                pos: logical_idx * self.block_size,
            })?;

        *slot = new_block;
        Ok(())
    }

    /// Resolve a write at `(seq, pos)` under copy-on-write.
    ///
    /// Shared covering block (ref count > 1): allocate a private block, drop
    /// one reference on the shared one, install the private id, and report
    /// which block's cells the caller must copy over. Exclusive block: the
    /// write can go straight in.
    pub fn prepare_write(
        &mut self,
        seq: SeqId,
        pos: usize,
        alloc: &mut BlockAllocator,
    ) -> Result<CowWrite, TableError> {
        let current = self.get_block_id(seq, pos)?;

        if alloc.ref_count(current) <= 1 {
            return Ok(CowWrite {
                block_id: current,
                copied_from: None,
            });
        }

        let fresh = alloc.allocate()?;
        alloc.free(current)?;
        self.replace_block(seq, pos / self.block_size, fresh)?;

        debug!(seq, pos, shared = current, private = fresh, "CoW block split");
        Ok(CowWrite {
            block_id: fresh,
            copied_from: Some(current),
        })
    }

    /// Copy-on-write share: `dst` gets the same block list as `src`, with
    /// every block's ref count bumped. Both sequences then read identical KV
    /// contents; the first writer splits off a private block via
    /// [`prepare_write`].
    ///
    /// The caller guarantees `dst` has no mapping yet.
    pub fn share(
        &mut self,
        src: SeqId,
        dst: SeqId,
        alloc: &mut BlockAllocator,
    ) -> Result<(), TableError> {
        debug_assert!(!self.has_seq(dst), "share destination already mapped");

        let blocks = self
            .tables
            .get(&src)
            .ok_or(TableError::UnknownSequence(src))?
            .clone();

        for &block_id in &blocks {
            alloc.inc_ref(block_id)?;
        }

        debug!(src, dst, blocks = blocks.len(), "Shared sequence blocks");
        self.tables.insert(dst, blocks);
        Ok(())
    }

    /// Release every block held by a sequence and drop its mapping.
    /// No-op (and idempotent) when the sequence is unknown.
    pub fn free_seq(&mut self, seq: SeqId, alloc: &mut BlockAllocator) -> Result<(), TableError> {
        let Some(blocks) = self.tables.remove(&seq) else {
            return Ok(());
        };

        for block_id in blocks {
            alloc.free(block_id)?;
        }

        Ok(())
    }

    /// Free the blocks covering positions `[pos_start, pos_end)` and shift
    /// later blocks left to close the gap. Any block the range touches, even
    /// partially, is removed. Used for context shift: O(1) per removed block,
    /// no cell data moves.
    pub fn remove_blocks_range(
        &mut self,
        seq: SeqId,
        pos_start: usize,
        pos_end: usize,
        alloc: &mut BlockAllocator,
    ) -> Result<(), TableError> {
        let Some(blocks) = self.tables.get_mut(&seq) else {
            return Ok(());
        };

        let block_start = pos_start / self.block_size;
        let block_end = pos_end.div_ceil(self.block_size).min(blocks.len());

        if block_start >= block_end {
            return Ok(());
        }

        for &block_id in &blocks[block_start..block_end] {
            alloc.free(block_id)?;
        }
        blocks.drain(block_start..block_end);

        debug!(
            seq,
            pos_start,
            pos_end,
            removed = block_end - block_start,
            "Removed block range"
        );
        Ok(())
    }

    /// Release everything across all sequences.
    pub fn clear(&mut self, alloc: &mut BlockAllocator) -> Result<(), TableError> {
        for (_, blocks) in self.tables.drain() {
            for block_id in blocks {
                alloc.free(block_id)?;
            }
        }
        Ok(())
    }
}
