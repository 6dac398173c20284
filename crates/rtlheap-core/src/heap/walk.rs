//! Heap enumeration.
//!
//! A walk visits every subheap in creation order (a region entry, then its
//! arenas in address order, then its uncommitted tail) followed by every
//! large block. The cursor remembers the heap generation it was last used
//! with; if the heap changed in between, the position is re-derived from the
//! subheap start so a walk never follows a stale arena address.

use crate::error::HeapError;

use super::arena::{ArenaState, INUSE_HEADER_SIZE, LARGE_HEADER_SIZE};
use super::engine::HeapCore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Start of a subheap; carries [`RegionInfo`].
    #[default]
    Region,
    Busy,
    Free,
    /// Freed block parked in the delayed-free ring.
    Pending,
    /// Reserved but not yet committed tail of a subheap.
    Uncommitted,
    Large,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionInfo {
    pub committed: usize,
    pub uncommitted: usize,
    pub first_block: usize,
    /// End of the committed range.
    pub last_block: usize,
}

/// One entry produced by [`HeapCore::walk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapEntry {
    pub kind: EntryKind,
    /// User pointer for blocks, base address for regions.
    pub addr: usize,
    /// User size for busy and large blocks, data size otherwise.
    pub size: usize,
    /// Header and padding bytes attributed to the entry.
    pub overhead: usize,
    /// Subheap the entry belongs to; zero for large blocks.
    pub region_index: usize,
    pub region: Option<RegionInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum WalkPos {
    #[default]
    Start,
    Region(usize),
    Arena {
        sub: usize,
        addr: usize,
    },
    Uncommitted(usize),
    Large(Option<usize>),
    Done,
}

/// Opaque walk position. Start a walk with [`WalkCursor::default`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkCursor {
    pos: WalkPos,
    generation: u64,
}

impl WalkCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.pos == WalkPos::Done
    }
}

impl HeapCore {
    /// Produces the entry after `cursor`, or `None` once the walk is over.
    pub fn walk(&self, cursor: &mut WalkCursor) -> Result<Option<HeapEntry>, HeapError> {
        if cursor.generation != self.generation {
            self.resync(cursor)?;
            cursor.generation = self.generation;
        }
        loop {
            match cursor.pos {
                WalkPos::Start => {
                    cursor.pos = if self.subheaps.is_empty() {
                        WalkPos::Large(None)
                    } else {
                        WalkPos::Region(0)
                    };
                }
                WalkPos::Region(index) => {
                    let Some(sub) = self.subheaps.get(index) else {
                        cursor.pos = WalkPos::Large(None);
                        continue;
                    };
                    cursor.pos = WalkPos::Arena {
                        sub: index,
                        addr: sub.first_arena(),
                    };
                    return Ok(Some(HeapEntry {
                        kind: EntryKind::Region,
                        addr: sub.base(),
                        size: sub.reserved(),
                        overhead: sub.header_size(),
                        region_index: index,
                        region: Some(RegionInfo {
                            committed: sub.committed(),
                            uncommitted: sub.reserved() - sub.committed(),
                            first_block: sub.first_arena(),
                            last_block: sub.committed_end(),
                        }),
                    }));
                }
                WalkPos::Arena { sub: index, addr } => {
                    let Some(sub) = self.subheaps.get(index) else {
                        cursor.pos = WalkPos::Large(None);
                        continue;
                    };
                    let committed_end = sub.committed_end();
                    if addr >= committed_end || addr >= sub.end() {
                        cursor.pos = WalkPos::Uncommitted(index);
                        continue;
                    }
                    let header = self.subheaps.read_header(addr)?;
                    let ptr = addr + INUSE_HEADER_SIZE;
                    let (kind, size, overhead) = match header.state {
                        ArenaState::InUse { unused } => (
                            EntryKind::Busy,
                            header.size - unused,
                            INUSE_HEADER_SIZE + unused,
                        ),
                        ArenaState::Pending { .. } => {
                            (EntryKind::Pending, header.size, INUSE_HEADER_SIZE)
                        }
                        ArenaState::Free => (
                            EntryKind::Free,
                            header.size.min(committed_end.saturating_sub(ptr)),
                            INUSE_HEADER_SIZE,
                        ),
                    };
                    cursor.pos = WalkPos::Arena {
                        sub: index,
                        addr: addr + header.total_size(),
                    };
                    return Ok(Some(HeapEntry {
                        kind,
                        addr: ptr,
                        size,
                        overhead,
                        region_index: index,
                        region: None,
                    }));
                }
                WalkPos::Uncommitted(index) => {
                    cursor.pos = WalkPos::Region(index + 1);
                    let Some(sub) = self.subheaps.get(index) else {
                        continue;
                    };
                    if sub.committed_end() >= sub.end() {
                        continue;
                    }
                    return Ok(Some(HeapEntry {
                        kind: EntryKind::Uncommitted,
                        addr: sub.committed_end(),
                        size: sub.end() - sub.committed_end(),
                        overhead: 0,
                        region_index: index,
                        region: None,
                    }));
                }
                WalkPos::Large(after) => match self.large.next_after(after) {
                    Some(block) => {
                        cursor.pos = WalkPos::Large(Some(block.base()));
                        return Ok(Some(HeapEntry {
                            kind: EntryKind::Large,
                            addr: block.user_ptr(),
                            size: block.data_size(),
                            overhead: LARGE_HEADER_SIZE + block.capacity() - block.data_size(),
                            region_index: 0,
                            region: None,
                        }));
                    }
                    None => cursor.pos = WalkPos::Done,
                },
                WalkPos::Done => return Ok(None),
            }
        }
    }

    /// Re-derives an arena position from the start of its subheap.
    fn resync(&self, cursor: &mut WalkCursor) -> Result<(), HeapError> {
        let WalkPos::Arena { sub: index, addr: target } = cursor.pos else {
            return Ok(());
        };
        let Some(sub) = self.subheaps.get(index) else {
            cursor.pos = WalkPos::Large(None);
            return Ok(());
        };
        let mut addr = sub.first_arena();
        while addr < target && addr < sub.committed_end() {
            addr += self.subheaps.read_header(addr)?.total_size();
        }
        cursor.pos = WalkPos::Arena { sub: index, addr };
        Ok(())
    }
}
