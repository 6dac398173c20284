//! Segregated free lists.
//!
//! Each bucket is a doubly-linked list threaded through the free arenas
//! themselves: the links live right after the free header, as virtual
//! addresses of neighboring free arenas (zero terminates). Only the heads,
//! tails and lengths are kept on the Rust side.

use crate::error::{CorruptionKind, HeapError};

use super::arena::{ArenaHeader, FreeLinks, INUSE_HEADER_SIZE};
use super::size_class::{NUM_BUCKETS, bucket_index};
use super::subheap::SubheapSet;

#[derive(Debug, Clone)]
pub struct FreeLists {
    heads: [usize; NUM_BUCKETS],
    tails: [usize; NUM_BUCKETS],
    lens: [usize; NUM_BUCKETS],
}

/// Reads the links of the free arena at `arena`.
pub fn read_links(mem: &SubheapSet, arena: usize) -> Result<FreeLinks, HeapError> {
    Ok(FreeLinks::decode(mem.read_array(arena + INUSE_HEADER_SIZE)?))
}

fn write_links(mem: &mut SubheapSet, arena: usize, links: FreeLinks) -> Result<(), HeapError> {
    mem.write(arena + INUSE_HEADER_SIZE, &links.encode())
}

/// Decodes `arena` and insists it is a free block.
fn linked_free(mem: &SubheapSet, arena: usize) -> Result<ArenaHeader, HeapError> {
    match mem.read_header(arena) {
        Ok(header) if header.is_free() => Ok(header),
        _ => Err(HeapError::corruption(arena, CorruptionKind::BadFreeListLink)),
    }
}

impl FreeLists {
    pub fn new() -> Self {
        Self {
            heads: [0; NUM_BUCKETS],
            tails: [0; NUM_BUCKETS],
            lens: [0; NUM_BUCKETS],
        }
    }

    pub fn head(&self, bucket: usize) -> usize {
        self.heads[bucket]
    }

    pub fn tail(&self, bucket: usize) -> usize {
        self.tails[bucket]
    }

    pub fn len(&self, bucket: usize) -> usize {
        self.lens[bucket]
    }

    pub fn total_len(&self) -> usize {
        self.lens.iter().sum()
    }

    /// Links a free arena of `total` bytes into its bucket. Last blocks of a
    /// subheap go to the tail so smaller, older holes are preferred.
    pub fn insert(
        &mut self,
        mem: &mut SubheapSet,
        arena: usize,
        total: usize,
        at_tail: bool,
    ) -> Result<(), HeapError> {
        let bucket = bucket_index(total);
        if at_tail {
            let prev = self.tails[bucket];
            write_links(mem, arena, FreeLinks { next: 0, prev })?;
            if prev != 0 {
                let mut links = read_links(mem, prev)?;
                links.next = arena;
                write_links(mem, prev, links)?;
            } else {
                self.heads[bucket] = arena;
            }
            self.tails[bucket] = arena;
        } else {
            let next = self.heads[bucket];
            write_links(mem, arena, FreeLinks { next, prev: 0 })?;
            if next != 0 {
                let mut links = read_links(mem, next)?;
                links.prev = arena;
                write_links(mem, next, links)?;
            } else {
                self.tails[bucket] = arena;
            }
            self.heads[bucket] = arena;
        }
        self.lens[bucket] += 1;
        Ok(())
    }

    /// Unlinks a free arena of `total` bytes. Every link is checked before
    /// anything is written.
    pub fn remove(&mut self, mem: &mut SubheapSet, arena: usize, total: usize) -> Result<(), HeapError> {
        let bucket = bucket_index(total);
        let broken = HeapError::corruption(arena, CorruptionKind::BadFreeListLink);
        let links = read_links(mem, arena)?;
        if links.prev == 0 {
            if self.heads[bucket] != arena {
                return Err(broken);
            }
        } else {
            linked_free(mem, links.prev)?;
            if read_links(mem, links.prev)?.next != arena {
                return Err(broken);
            }
        }
        if links.next == 0 {
            if self.tails[bucket] != arena {
                return Err(broken);
            }
        } else {
            linked_free(mem, links.next)?;
            if read_links(mem, links.next)?.prev != arena {
                return Err(broken);
            }
        }

        if links.prev == 0 {
            self.heads[bucket] = links.next;
        } else {
            let mut prev = read_links(mem, links.prev)?;
            prev.next = links.next;
            write_links(mem, links.prev, prev)?;
        }
        if links.next == 0 {
            self.tails[bucket] = links.prev;
        } else {
            let mut next = read_links(mem, links.next)?;
            next.prev = links.prev;
            write_links(mem, links.next, next)?;
        }
        self.lens[bucket] = self.lens[bucket].saturating_sub(1);
        Ok(())
    }

    /// First free arena of at least `need` total bytes, searching from the
    /// bucket `need` maps to upward.
    pub fn find_fit(
        &self,
        mem: &SubheapSet,
        need: usize,
    ) -> Result<Option<(usize, ArenaHeader)>, HeapError> {
        for bucket in bucket_index(need)..NUM_BUCKETS {
            let mut cur = self.heads[bucket];
            let mut steps = 0;
            while cur != 0 {
                let header = linked_free(mem, cur)?;
                if header.total_size() >= need {
                    return Ok(Some((cur, header)));
                }
                steps += 1;
                if steps >= self.lens[bucket] && read_links(mem, cur)?.next != 0 {
                    return Err(HeapError::corruption(cur, CorruptionKind::BadFreeListLink));
                }
                cur = read_links(mem, cur)?.next;
            }
        }
        Ok(None)
    }
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}
