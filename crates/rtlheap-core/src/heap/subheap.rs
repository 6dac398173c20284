//! Subheaps and the address-keyed memory view over them.
//!
//! A subheap is one reserved region laid out as a signature header followed
//! by arenas tiling the rest of the reservation. Only the committed prefix is
//! readable; the last free arena may extend past it.

use std::collections::BTreeMap;

use crate::backing::{BackingStore, Region, align_up};
use crate::error::{CorruptionKind, HeapError};

use super::arena::{
    self, ALIGNMENT, ArenaHeader, FIRST_SUBHEAP_HEADER_SIZE, FREE_HEADER_SIZE, HEAP_HEADER_OFFSET,
    HeapRecord, INUSE_HEADER_SIZE, MIN_ARENA_SIZE, SUBHEAP_HEADER_SIZE, SubheapRecord,
};

/// Largest reservation a subheap may have; arena sizes are stored in 32 bits.
pub const MAX_SUBHEAP_SIZE: usize = 0xffff_0000;

#[derive(Debug)]
pub struct Subheap {
    region: Region,
    header_size: usize,
    /// End of the arena space; below the reservation end for fixed heaps.
    end: usize,
}

impl Subheap {
    pub fn base(&self) -> usize {
        self.region.base()
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn reserved(&self) -> usize {
        self.region.reserved()
    }

    pub fn committed(&self) -> usize {
        self.region.committed()
    }

    pub fn committed_end(&self) -> usize {
        self.base() + self.committed()
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn first_arena(&self) -> usize {
        self.base() + self.header_size
    }

    pub fn into_region(self) -> Region {
        self.region
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) {
        self.region.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Parameters for a new subheap.
#[derive(Debug, Clone, Copy)]
pub struct SubheapSpec {
    pub owner: u64,
    /// `Some(flags)` for the first subheap, which also carries the heap record.
    pub heap_flags: Option<u32>,
    pub reserve: usize,
    /// Arena bytes after the header, when smaller than the reservation.
    pub limit: Option<usize>,
    pub commit: usize,
    pub commit_granularity: usize,
    pub free_checking: bool,
}

/// Reserves and formats a subheap holding one free arena.
///
/// Returns the subheap, the free arena address and its data size. The arena
/// is not linked into any free list yet.
pub fn create(
    store: &dyn BackingStore,
    spec: SubheapSpec,
) -> Result<(Subheap, usize, usize), HeapError> {
    let header_size = if spec.heap_flags.is_some() {
        FIRST_SUBHEAP_HEADER_SIZE
    } else {
        SUBHEAP_HEADER_SIZE
    };
    if spec.reserve > MAX_SUBHEAP_SIZE {
        return Err(HeapError::Exhausted {
            requested: spec.reserve,
        });
    }
    let mut region = store.reserve(spec.reserve.max(header_size + MIN_ARENA_SIZE))?;
    let reserved = region.reserved();
    if reserved > MAX_SUBHEAP_SIZE {
        store.release(region);
        return Err(HeapError::Exhausted {
            requested: spec.reserve,
        });
    }
    let commit = align_up(
        spec.commit.max(header_size + FREE_HEADER_SIZE),
        spec.commit_granularity,
    )
    .map_or(reserved, |c| c.min(reserved));
    if let Err(err) = store.commit(&mut region, commit) {
        store.release(region);
        return Err(err);
    }

    let arena_space = reserved - header_size;
    let arena_space = spec
        .limit
        .and_then(|limit| align_up(limit.max(MIN_ARENA_SIZE), ALIGNMENT))
        .map_or(arena_space, |limit| limit.min(arena_space));
    let end = region.base() + header_size + arena_space;
    let mut sub = Subheap {
        region,
        header_size,
        end,
    };
    let base = sub.base();
    sub.write_at(
        0,
        &SubheapRecord {
            owner: spec.owner,
            base,
            reserved,
        }
        .encode(),
    );
    if let Some(flags) = spec.heap_flags {
        sub.write_at(
            HEAP_HEADER_OFFSET,
            &HeapRecord {
                flags,
                owner: spec.owner,
            }
            .encode(),
        );
    }
    let arena = sub.first_arena();
    let data = sub.end() - arena - INUSE_HEADER_SIZE;
    sub.write_at(header_size, &ArenaHeader::free(data).encode());
    if spec.free_checking {
        let from = header_size + FREE_HEADER_SIZE;
        let to = sub.committed();
        fill_free_pattern(&mut sub.region.bytes_mut()[from..to], base + from);
    }
    Ok((sub, arena, data))
}

fn fill_free_pattern(bytes: &mut [u8], addr: usize) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = arena::free_filler_byte(addr + i);
    }
}

/// Subheaps in creation order plus an address index.
#[derive(Debug, Default)]
pub struct SubheapSet {
    list: Vec<Subheap>,
    by_base: BTreeMap<usize, usize>,
}

impl SubheapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sub: Subheap) -> usize {
        let index = self.list.len();
        self.by_base.insert(sub.base(), index);
        self.list.push(sub);
        index
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Subheap> {
        self.list.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subheap> {
        self.list.iter()
    }

    /// Index of the subheap whose reservation contains `addr`.
    pub fn locate(&self, addr: usize) -> Option<usize> {
        let (_, &index) = self.by_base.range(..=addr).next_back()?;
        self.list[index].region.contains(addr).then_some(index)
    }

    /// Subheap containing `addr`, as a corruption error if there is none.
    pub fn subheap_of(&self, addr: usize) -> Result<&Subheap, HeapError> {
        self.locate(addr)
            .map(|index| &self.list[index])
            .ok_or(HeapError::corruption(addr, CorruptionKind::OutOfBounds))
    }

    fn span(&self, addr: usize, len: usize) -> Result<(usize, usize), HeapError> {
        let out_of_bounds = HeapError::corruption(addr, CorruptionKind::OutOfBounds);
        let index = self.locate(addr).ok_or(out_of_bounds.clone())?;
        let sub = &self.list[index];
        let offset = addr - sub.base();
        match offset.checked_add(len) {
            Some(end) if end <= sub.committed() => Ok((index, offset)),
            _ => Err(out_of_bounds),
        }
    }

    pub fn bytes(&self, addr: usize, len: usize) -> Result<&[u8], HeapError> {
        let (index, offset) = self.span(addr, len)?;
        Ok(&self.list[index].region.bytes()[offset..offset + len])
    }

    pub fn bytes_mut(&mut self, addr: usize, len: usize) -> Result<&mut [u8], HeapError> {
        let (index, offset) = self.span(addr, len)?;
        Ok(&mut self.list[index].region.bytes_mut()[offset..offset + len])
    }

    pub fn read_array<const N: usize>(&self, addr: usize) -> Result<[u8; N], HeapError> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(self.bytes(addr, N)?);
        Ok(raw)
    }

    pub fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), HeapError> {
        self.bytes_mut(addr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Writes the free filler over `[from, to)`, clipped to the committed end.
    pub fn fill_free(&mut self, from: usize, to: usize) -> Result<(), HeapError> {
        let committed_end = self.subheap_of(from)?.committed_end();
        let to = to.min(committed_end);
        if from >= to {
            return Ok(());
        }
        fill_free_pattern(self.bytes_mut(from, to - from)?, from);
        Ok(())
    }

    /// Offset of the first byte in `[from, to)` (clipped to the committed
    /// end) that does not hold the free filler.
    pub fn find_filler_mismatch(&self, from: usize, to: usize) -> Result<Option<usize>, HeapError> {
        let committed_end = self.subheap_of(from)?.committed_end();
        let to = to.min(committed_end);
        if from >= to {
            return Ok(None);
        }
        Ok(self
            .bytes(from, to - from)?
            .iter()
            .enumerate()
            .find(|&(i, &b)| b != arena::free_filler_byte(from + i))
            .map(|(i, _)| from + i))
    }

    pub fn read_header(&self, addr: usize) -> Result<ArenaHeader, HeapError> {
        ArenaHeader::decode(addr, self.read_array(addr)?)
    }

    pub fn write_header(&mut self, addr: usize, header: &ArenaHeader) -> Result<(), HeapError> {
        self.write(addr, &header.encode())
    }

    pub fn read_u64(&self, addr: usize) -> Result<usize, HeapError> {
        Ok(u64::from_le_bytes(self.read_array(addr)?) as usize)
    }

    pub fn write_u64(&mut self, addr: usize, value: usize) -> Result<(), HeapError> {
        self.write(addr, &(value as u64).to_le_bytes())
    }

    /// Commits subheap `index` up to `end_addr` rounded to `granularity`.
    /// Returns the number of newly committed bytes.
    pub fn commit_upto(
        &mut self,
        store: &dyn BackingStore,
        index: usize,
        end_addr: usize,
        granularity: usize,
        free_checking: bool,
    ) -> Result<usize, HeapError> {
        let sub = &mut self.list[index];
        let target = align_up(end_addr - sub.base(), granularity)
            .map_or(sub.reserved(), |t| t.min(sub.reserved()));
        let old = sub.committed();
        if target <= old {
            return Ok(0);
        }
        store.commit(&mut sub.region, target)?;
        let new = sub.committed();
        if free_checking && new > old {
            let base = sub.base();
            fill_free_pattern(&mut sub.region.bytes_mut()[old..new], base + old);
        }
        Ok(new - old)
    }

    /// Removes every subheap, in creation order.
    pub fn take_all(&mut self) -> Vec<Subheap> {
        self.by_base.clear();
        std::mem::take(&mut self.list)
    }
}
