//! Heap consistency checks.

use crate::error::{CorruptionKind, HeapError};
use crate::flags::HeapFlags;
use crate::log::HeapLogLevel;

use super::arena::{
    ArenaState, FREE_HEADER_SIZE, HEAP_HEADER_OFFSET, HeapRecord, INUSE_HEADER_SIZE,
    SubheapRecord,
};
use super::engine::{HeapCore, Located, live_unused};
use super::free_list::read_links;
use super::size_class::{NUM_BUCKETS, bucket_index};
use super::subheap::Subheap;

impl HeapCore {
    /// Checks one block (`Some(ptr)`) or the whole heap (`None`). Failures
    /// are logged and reported as `false`.
    pub fn validate(&mut self, _flags: HeapFlags, ptr: Option<usize>) -> bool {
        let result = match ptr {
            Some(ptr) => self.check_block(ptr),
            None => self.check_heap(),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                self.note(
                    HeapLogLevel::Warn,
                    "validate",
                    "validate_failed",
                    ptr,
                    None,
                    "failed",
                    err.to_string(),
                );
                false
            }
        }
    }

    /// Whole-heap check returning the first problem found.
    pub fn check(&self) -> Result<(), HeapError> {
        self.check_heap()
    }

    /// Checks a single live block: its header and, with tail checking, its
    /// guard bytes.
    pub fn check_block(&self, ptr: usize) -> Result<(), HeapError> {
        match self.locate(ptr)? {
            Located::Large { ptr } => {
                let block = self
                    .large
                    .lookup(ptr)
                    .ok_or(HeapError::InvalidPointer { addr: ptr })?;
                let header = block.header()?;
                if header.data_size != block.data_size() || header.block_size != block.block_size()
                {
                    return Err(HeapError::corruption(
                        block.base(),
                        CorruptionKind::BadLargeMagic,
                    ));
                }
                self.verify_tail(
                    self.flags,
                    ptr,
                    Self::large_tail(block.data_size(), block.capacity()),
                )
            }
            Located::Small { header, .. } => {
                let unused = live_unused(ptr, header)?;
                self.verify_tail(self.flags, ptr, header.size - unused..header.size)
            }
        }
    }

    pub(super) fn check_heap(&self) -> Result<(), HeapError> {
        let mut free_seen = 0;
        for (index, sub) in self.subheaps.iter().enumerate() {
            self.check_signature(index, sub)?;
            free_seen += self.check_subheap(sub)?;
        }
        self.check_free_lists(free_seen)?;
        for &arena in self.pending.iter() {
            let header = self.subheaps.read_header(arena)?;
            if !matches!(header.state, ArenaState::Pending { .. }) {
                return Err(HeapError::corruption(arena, CorruptionKind::BadInUseMagic));
            }
        }
        for block in self.large.iter() {
            self.check_block(block.user_ptr())?;
        }
        Ok(())
    }

    fn check_signature(&self, index: usize, sub: &Subheap) -> Result<(), HeapError> {
        let base = sub.base();
        let bad = HeapError::corruption(base, CorruptionKind::BadSignature);
        let record = SubheapRecord::decode(base, self.subheaps.read_array(base)?)?;
        if record.owner != self.id || record.base != base || record.reserved != sub.reserved() {
            return Err(bad);
        }
        if index == 0 {
            let at = base + HEAP_HEADER_OFFSET;
            let heap = HeapRecord::decode(at, self.subheaps.read_array(at)?)?;
            if heap.owner != self.id || heap.flags != self.flags.bits() {
                return Err(bad);
            }
        }
        Ok(())
    }

    /// Walks every arena of `sub`; returns the number of free arenas seen.
    fn check_subheap(&self, sub: &Subheap) -> Result<usize, HeapError> {
        let end = sub.end();
        let committed_end = sub.committed_end();
        let mut addr = sub.first_arena();
        let mut prev_free = false;
        let mut prev_addr = 0;
        let mut free_count = 0;
        while addr < end {
            if addr + INUSE_HEADER_SIZE > committed_end {
                return Err(HeapError::corruption(addr, CorruptionKind::OutOfBounds));
            }
            let header = self.subheaps.read_header(addr)?;
            let next = addr
                .checked_add(header.total_size())
                .filter(|&next| next <= end)
                .ok_or(HeapError::corruption(addr, CorruptionKind::OutOfBounds))?;
            if header.is_free() && prev_free {
                return Err(HeapError::corruption(addr, CorruptionKind::AdjacentFree));
            }
            if header.prev_free != prev_free {
                return Err(HeapError::corruption(addr, CorruptionKind::FlagParity));
            }
            if prev_free && self.subheaps.read_u64(addr - INUSE_HEADER_SIZE)? != prev_addr {
                return Err(HeapError::corruption(addr, CorruptionKind::BadBackPointer));
            }
            let ptr = addr + INUSE_HEADER_SIZE;
            match header.state {
                ArenaState::InUse { unused } => {
                    if next > committed_end {
                        return Err(HeapError::corruption(addr, CorruptionKind::OutOfBounds));
                    }
                    self.verify_tail(self.flags, ptr, header.size - unused..header.size)?;
                }
                ArenaState::Pending { .. } => {
                    if let Some(bad) = self.subheaps.find_filler_mismatch(ptr, next)? {
                        return Err(HeapError::corruption(bad, CorruptionKind::WriteAfterFree));
                    }
                }
                ArenaState::Free => {
                    free_count += 1;
                    if self.free_checking() {
                        let from = addr + FREE_HEADER_SIZE;
                        let to = addr + header.size;
                        if let Some(bad) = self.subheaps.find_filler_mismatch(from, to)? {
                            return Err(HeapError::corruption(bad, CorruptionKind::WriteAfterFree));
                        }
                    }
                }
            }
            prev_free = header.is_free();
            prev_addr = addr;
            addr = next;
        }
        Ok(free_count)
    }

    fn check_free_lists(&self, free_seen: usize) -> Result<(), HeapError> {
        let mut total = 0;
        for bucket in 0..NUM_BUCKETS {
            let expected = self.free_lists.len(bucket);
            let mut prev = 0;
            let mut cur = self.free_lists.head(bucket);
            let mut count = 0;
            while cur != 0 {
                let broken = HeapError::corruption(cur, CorruptionKind::BadFreeListLink);
                if count >= expected {
                    return Err(broken);
                }
                let header = match self.subheaps.read_header(cur) {
                    Ok(header) if header.is_free() => header,
                    _ => return Err(broken),
                };
                if bucket_index(header.total_size()) != bucket {
                    return Err(HeapError::corruption(cur, CorruptionKind::WrongBucket));
                }
                let links = read_links(&self.subheaps, cur)?;
                if links.prev != prev {
                    return Err(broken);
                }
                count += 1;
                prev = cur;
                cur = links.next;
            }
            if self.free_lists.tail(bucket) != prev || count != expected {
                return Err(HeapError::corruption(prev, CorruptionKind::BadFreeListLink));
            }
            total += count;
        }
        if total != free_seen || self.free_lists.total_len() != total {
            return Err(HeapError::corruption(0, CorruptionKind::BadFreeListLink));
        }
        Ok(())
    }
}
