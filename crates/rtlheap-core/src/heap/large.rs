//! Large block path.
//!
//! Requests at or above the heap's large threshold bypass the subheaps and
//! get a region of their own: a 48-byte header followed by the data, the
//! whole block rounded up to a page. Blocks are never split and never enter
//! a free list; freeing one returns the region to the backing store.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::backing::{BackingStore, PAGE_SIZE, Region, align_up};
use crate::error::HeapError;

use super::arena::{self, LARGE_HEADER_SIZE, LargeHeader};

/// Rounds a size up to the nearest page boundary.
fn page_align(size: usize) -> Option<usize> {
    align_up(size, PAGE_SIZE)
}

#[derive(Debug)]
pub struct LargeBlock {
    region: Region,
    data_size: usize,
    block_size: usize,
}

impl LargeBlock {
    pub fn base(&self) -> usize {
        self.region.base()
    }

    pub fn user_ptr(&self) -> usize {
        self.base() + LARGE_HEADER_SIZE
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn reserved(&self) -> usize {
        self.region.reserved()
    }

    /// Bytes available to the caller without moving the block.
    pub fn capacity(&self) -> usize {
        self.block_size - LARGE_HEADER_SIZE
    }

    /// Decodes the header stored in the region.
    pub fn header(&self) -> Result<LargeHeader, HeapError> {
        let mut raw = [0u8; LARGE_HEADER_SIZE];
        raw.copy_from_slice(&self.region.bytes()[..LARGE_HEADER_SIZE]);
        LargeHeader::decode(self.base(), raw)
    }

    pub fn set_data_size(&mut self, data_size: usize) {
        self.data_size = data_size;
        self.write_header();
    }

    pub fn data(&self) -> &[u8] {
        &self.region.bytes()[LARGE_HEADER_SIZE..self.block_size]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = self.block_size;
        &mut self.region.bytes_mut()[LARGE_HEADER_SIZE..end]
    }

    /// Raw committed bytes of the region, header included.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.region.bytes_mut()
    }

    pub fn into_region(self) -> Region {
        self.region
    }

    fn write_header(&mut self) {
        let header = LargeHeader {
            data_size: self.data_size,
            block_size: self.block_size,
        };
        self.region.bytes_mut()[..LARGE_HEADER_SIZE].copy_from_slice(&header.encode());
    }
}

/// Live large blocks keyed by region base.
#[derive(Debug, Default)]
pub struct LargeBlocks {
    blocks: BTreeMap<usize, LargeBlock>,
    total_mapped: usize,
}

impl LargeBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a dedicated block for `size` user bytes and returns the user pointer.
    pub fn alloc(
        &mut self,
        store: &dyn BackingStore,
        size: usize,
        tail_checking: bool,
    ) -> Result<usize, HeapError> {
        let overflow = HeapError::Overflow { requested: size };
        let block_size = arena::round_size(size, tail_checking)
            .and_then(|r| r.checked_add(LARGE_HEADER_SIZE))
            .and_then(page_align)
            .ok_or(overflow)?;
        let mut region = store.reserve(block_size)?;
        if let Err(err) = store.commit(&mut region, block_size) {
            store.release(region);
            return Err(err);
        }
        let mut block = LargeBlock {
            region,
            data_size: size,
            block_size,
        };
        block.write_header();
        let ptr = block.user_ptr();
        self.total_mapped += block_size;
        self.blocks.insert(block.base(), block);
        Ok(ptr)
    }

    /// Block whose user pointer is exactly `ptr`.
    pub fn lookup(&self, ptr: usize) -> Option<&LargeBlock> {
        self.blocks.get(&ptr.checked_sub(LARGE_HEADER_SIZE)?)
    }

    pub fn lookup_mut(&mut self, ptr: usize) -> Option<&mut LargeBlock> {
        self.blocks.get_mut(&ptr.checked_sub(LARGE_HEADER_SIZE)?)
    }

    /// Block whose committed range contains `addr`.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn containing_mut(&mut self, addr: usize) -> Option<&mut LargeBlock> {
        let (_, block) = self.blocks.range_mut(..=addr).next_back()?;
        (addr < block.base() + block.block_size).then_some(block)
    }

    /// Unregisters a block; the caller returns its region to the store.
    pub fn remove(&mut self, ptr: usize) -> Option<LargeBlock> {
        let block = self.blocks.remove(&ptr.checked_sub(LARGE_HEADER_SIZE)?)?;
        self.total_mapped -= block.block_size;
        Some(block)
    }

    /// First block whose base is above `after`, or the first block at all.
    pub fn next_after(&self, after: Option<usize>) -> Option<&LargeBlock> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.blocks
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(_, block)| block)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LargeBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Bytes committed for large blocks.
    pub fn total_mapped(&self) -> usize {
        self.total_mapped
    }

    pub fn take_all(&mut self) -> Vec<LargeBlock> {
        self.total_mapped = 0;
        std::mem::take(&mut self.blocks).into_values().collect()
    }
}
