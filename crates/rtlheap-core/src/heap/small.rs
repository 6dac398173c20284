//! Subheap block surgery: carving, splitting, coalescing, growth and the
//! delayed-free path.

use crate::error::{CorruptionKind, HeapError};
use crate::flags::HeapFlags;
use crate::log::HeapLogLevel;

use super::arena::{
    ArenaHeader, ArenaState, FREE_HEADER_SIZE, INUSE_HEADER_SIZE, MIN_ARENA_SIZE, MIN_SHRINK_SIZE,
    SUBHEAP_HEADER_SIZE,
};
use super::engine::{HeapCore, live_unused};
use super::subheap::{self, MAX_SUBHEAP_SIZE, SubheapSpec};

/// Below this reservation a failed grow is not retried at half size.
const MIN_GROW_RETRY_SIZE: usize = 4 * 1024 * 1024;

impl HeapCore {
    /// Finds, commits and unlinks a free arena able to hold `rounded` data
    /// bytes, growing the heap when allowed.
    pub(super) fn take_free_block(
        &mut self,
        flags: HeapFlags,
        size: usize,
        rounded: usize,
    ) -> Result<(usize, ArenaHeader), HeapError> {
        let need = rounded
            .checked_add(INUSE_HEADER_SIZE)
            .ok_or(HeapError::Overflow { requested: size })?;
        let (arena, header) = match self.free_lists.find_fit(&self.subheaps, need)? {
            Some(hit) => hit,
            None if flags.contains(HeapFlags::GROWABLE) => self.grow(size, rounded)?,
            None => return Err(HeapError::Exhausted { requested: size }),
        };
        self.commit_for(arena, header.size, rounded, MIN_ARENA_SIZE)?;
        self.free_lists
            .remove(&mut self.subheaps, arena, header.total_size())?;
        Ok((arena, header))
    }

    /// Commits enough of the arena's subheap to hold `keep` data bytes, plus
    /// the free header of the remainder when one will be split off.
    pub(super) fn commit_for(
        &mut self,
        arena: usize,
        data: usize,
        keep: usize,
        min_split: usize,
    ) -> Result<(), HeapError> {
        let split = data - keep >= min_split;
        let end = if split {
            arena + INUSE_HEADER_SIZE + keep + FREE_HEADER_SIZE
        } else {
            arena + INUSE_HEADER_SIZE + data
        };
        let index = self
            .subheaps
            .locate(arena)
            .ok_or(HeapError::corruption(arena, CorruptionKind::OutOfBounds))?;
        let granularity = self.config.commit_granularity;
        let free_checking = self.free_checking();
        let grown = self.subheaps.commit_upto(
            self.store.as_ref(),
            index,
            end,
            granularity,
            free_checking,
        )?;
        if grown > 0 {
            self.note(
                HeapLogLevel::Debug,
                "allocate",
                "commit",
                Some(arena),
                Some(grown),
                "success",
                format!("subheap={index}"),
            );
        }
        Ok(())
    }

    /// Turns an unlinked free arena into an in-use one of at least `rounded`
    /// data bytes and returns its final data size.
    pub(super) fn carve(
        &mut self,
        arena: usize,
        header: ArenaHeader,
        rounded: usize,
    ) -> Result<usize, HeapError> {
        let sub_end = self.subheaps.subheap_of(arena)?.end();
        self.subheaps
            .write_header(arena, &ArenaHeader::in_use(header.size, 0, false))?;
        let next = arena + INUSE_HEADER_SIZE + header.size;
        if next < sub_end {
            self.set_prev_free(next, false)?;
        }
        self.shrink_block(arena, rounded, MIN_ARENA_SIZE, false)
    }

    fn set_prev_free(&mut self, arena: usize, prev_free: bool) -> Result<(), HeapError> {
        let header = self.subheaps.read_header(arena)?;
        if header.prev_free != prev_free {
            self.subheaps
                .write_header(arena, &ArenaHeader { prev_free, ..header })?;
        }
        Ok(())
    }

    /// Splits the tail off an in-use arena if at least `min_split` bytes
    /// would be left over. Returns the data size the arena ends up with.
    /// The header is left with zero unused bytes for the caller to finish.
    pub(super) fn shrink_block(
        &mut self,
        arena: usize,
        keep: usize,
        min_split: usize,
        fill: bool,
    ) -> Result<usize, HeapError> {
        let header = self.subheaps.read_header(arena)?;
        let data = header.size;
        if data < keep || data - keep < min_split {
            return Ok(data);
        }
        self.subheaps
            .write_header(arena, &ArenaHeader::in_use(keep, 0, header.prev_free))?;
        let rest = arena + INUSE_HEADER_SIZE + keep;
        let rest_data = data - keep - INUSE_HEADER_SIZE;
        if fill && self.free_checking() {
            self.subheaps
                .fill_free(rest + FREE_HEADER_SIZE, rest + rest_data)?;
        }
        self.create_free_block(rest, rest_data)?;
        Ok(keep)
    }

    /// Writes a free arena at `addr`, absorbing a free successor, and links it.
    pub(super) fn create_free_block(&mut self, addr: usize, data: usize) -> Result<(), HeapError> {
        let sub_end = self.subheaps.subheap_of(addr)?.end();
        let mut data = data;
        let next = addr + INUSE_HEADER_SIZE + data;
        if next < sub_end {
            let next_header = self.subheaps.read_header(next)?;
            if next_header.is_free() {
                self.free_lists
                    .remove(&mut self.subheaps, next, next_header.total_size())?;
                if self.free_checking() {
                    self.subheaps
                        .fill_free(next - INUSE_HEADER_SIZE, next + FREE_HEADER_SIZE)?;
                }
                data += next_header.total_size();
            }
        }
        self.subheaps.write_header(addr, &ArenaHeader::free(data))?;
        let next = addr + INUSE_HEADER_SIZE + data;
        let last = next >= sub_end;
        if !last {
            self.set_prev_free(next, true)?;
            self.subheaps.write_u64(next - INUSE_HEADER_SIZE, addr)?;
        }
        self.free_lists
            .insert(&mut self.subheaps, addr, data + INUSE_HEADER_SIZE, last)
    }

    /// Returns an in-use or pending arena to the free lists, merging with
    /// free neighbors on both sides.
    pub(super) fn make_free(&mut self, arena: usize, header: ArenaHeader) -> Result<(), HeapError> {
        let sub_end = self.subheaps.subheap_of(arena)?.end();
        let next = arena + INUSE_HEADER_SIZE + header.size;
        if next < sub_end {
            self.subheaps.read_header(next)?;
        }

        let prev = if header.prev_free {
            let back = self.subheaps.read_u64(arena - INUSE_HEADER_SIZE)?;
            let prev_header = (back < arena)
                .then(|| self.subheaps.read_header(back).ok())
                .flatten()
                .filter(|h| h.is_free() && back.checked_add(h.total_size()) == Some(arena))
                .ok_or(HeapError::corruption(arena, CorruptionKind::BadBackPointer))?;
            Some((back, prev_header))
        } else {
            None
        };

        let free_checking = self.free_checking();
        match prev {
            Some((back, prev_header)) => {
                self.free_lists
                    .remove(&mut self.subheaps, back, prev_header.total_size())?;
                if free_checking {
                    self.subheaps
                        .fill_free(arena - INUSE_HEADER_SIZE, arena + header.size)?;
                }
                self.create_free_block(back, prev_header.size + header.total_size())
            }
            None => {
                if free_checking {
                    self.subheaps
                        .fill_free(arena + FREE_HEADER_SIZE, arena + header.size)?;
                }
                self.create_free_block(arena, header.size)
            }
        }
    }

    /// Frees a live subheap block, parking it when free checking is on.
    pub(super) fn release_small(&mut self, arena: usize, header: ArenaHeader) -> Result<(), HeapError> {
        let ptr = arena + INUSE_HEADER_SIZE;
        let unused = live_unused(ptr, header)?;
        let size = header.size - unused;
        let event = if self.free_checking() {
            self.park_pending(arena, header, unused)?;
            "free_pending"
        } else {
            self.make_free(arena, header)?;
            "free"
        };
        self.live_blocks = self.live_blocks.saturating_sub(1);
        self.live_bytes = self.live_bytes.saturating_sub(size);
        self.note(
            HeapLogLevel::Trace,
            "free",
            event,
            Some(ptr),
            Some(size),
            "success",
            "path=free_list",
        );
        Ok(())
    }

    fn park_pending(
        &mut self,
        arena: usize,
        header: ArenaHeader,
        unused: usize,
    ) -> Result<(), HeapError> {
        let ptr = arena + INUSE_HEADER_SIZE;
        self.subheaps.fill_free(ptr, ptr + header.size)?;
        self.subheaps.write_header(
            arena,
            &ArenaHeader {
                state: ArenaState::Pending { unused },
                ..header
            },
        )?;
        if let Some(evicted) = self.pending.push(arena) {
            self.flush_pending(evicted);
        }
        Ok(())
    }

    /// Verifies a parked block and hands it to the free lists. A block that
    /// was written to after being freed is reported and leaked. Returns the
    /// arena bytes reclaimed.
    pub(super) fn flush_pending(&mut self, arena: usize) -> usize {
        let ptr = arena + INUSE_HEADER_SIZE;
        let header = match self.subheaps.read_header(arena) {
            Ok(header) if matches!(header.state, ArenaState::Pending { .. }) => header,
            Ok(_) => {
                self.report_leak(arena, "pending block lost its tag");
                return 0;
            }
            Err(err) => {
                self.report_leak(arena, err.to_string());
                return 0;
            }
        };
        match self.subheaps.find_filler_mismatch(ptr, ptr + header.size) {
            Ok(None) => {}
            Ok(Some(addr)) => {
                let err = HeapError::corruption(addr, CorruptionKind::WriteAfterFree);
                self.report_leak(arena, err.to_string());
                return 0;
            }
            Err(err) => {
                self.report_leak(arena, err.to_string());
                return 0;
            }
        }
        match self.make_free(arena, header) {
            Ok(()) => {
                self.note(
                    HeapLogLevel::Trace,
                    "free",
                    "pending_flush",
                    Some(ptr),
                    Some(header.size),
                    "success",
                    "released",
                );
                header.total_size()
            }
            Err(err) => {
                self.report_leak(arena, err.to_string());
                0
            }
        }
    }

    fn report_leak(&mut self, arena: usize, details: impl Into<String>) {
        self.note(
            HeapLogLevel::Error,
            "free",
            "corruption_detected",
            Some(arena + INUSE_HEADER_SIZE),
            None,
            "leaked",
            details,
        );
    }

    /// Reserves a new subheap large enough for `rounded` data bytes.
    /// Returns its single free arena, already linked.
    pub(super) fn grow(
        &mut self,
        size: usize,
        rounded: usize,
    ) -> Result<(usize, ArenaHeader), HeapError> {
        let exhausted = HeapError::Exhausted { requested: size };
        let total = rounded
            .checked_add(SUBHEAP_HEADER_SIZE + INUSE_HEADER_SIZE + FREE_HEADER_SIZE)
            .filter(|&total| total <= MAX_SUBHEAP_SIZE)
            .ok_or(exhausted)?;
        let owner = self.id;
        let commit_granularity = self.config.commit_granularity;
        let free_checking = self.free_checking();
        let spec = |reserve: usize| SubheapSpec {
            owner,
            heap_flags: None,
            reserve: reserve.max(total).min(MAX_SUBHEAP_SIZE),
            limit: None,
            commit: total,
            commit_granularity,
            free_checking,
        };

        let mut result = subheap::create(self.store.as_ref(), spec(self.grow_size));
        if result.is_ok() {
            self.grow_size = self
                .grow_size
                .saturating_mul(2)
                .min(self.config.max_grow_size.max(self.grow_size));
        } else {
            while self.grow_size > total && self.grow_size > MIN_GROW_RETRY_SIZE {
                self.grow_size /= 2;
                result = subheap::create(self.store.as_ref(), spec(self.grow_size));
                if result.is_ok() {
                    break;
                }
            }
        }
        let (sub, arena, data) = result.map_err(|_| HeapError::Exhausted { requested: size })?;
        let (base, reserved) = (sub.base(), sub.reserved());
        let index = self.subheaps.push(sub);
        self.free_lists
            .insert(&mut self.subheaps, arena, data + INUSE_HEADER_SIZE, true)?;
        self.note(
            HeapLogLevel::Info,
            "allocate",
            "subheap_grow",
            Some(base),
            Some(reserved),
            "success",
            format!("subheap={index} next_grow={:#x}", self.grow_size),
        );
        Ok((arena, ArenaHeader::free(data)))
    }

    /// Extends an in-use arena over its free successor. Returns the new data
    /// size, or `None` when the successor cannot supply enough room.
    pub(super) fn grow_in_place(
        &mut self,
        arena: usize,
        header: ArenaHeader,
        rounded: usize,
    ) -> Result<Option<usize>, HeapError> {
        let sub_end = self.subheaps.subheap_of(arena)?.end();
        let next = arena + INUSE_HEADER_SIZE + header.size;
        if next >= sub_end {
            return Ok(None);
        }
        let next_header = self.subheaps.read_header(next)?;
        if !next_header.is_free() {
            return Ok(None);
        }
        let combined = header.size + next_header.total_size();
        if combined < rounded {
            return Ok(None);
        }
        self.commit_for(arena, combined, rounded, MIN_SHRINK_SIZE)?;
        self.free_lists
            .remove(&mut self.subheaps, next, next_header.total_size())?;
        self.subheaps
            .write_header(arena, &ArenaHeader::in_use(combined, 0, header.prev_free))?;
        let after = arena + INUSE_HEADER_SIZE + combined;
        if after < sub_end {
            self.set_prev_free(after, false)?;
        }
        self.shrink_block(arena, rounded, MIN_SHRINK_SIZE, false)
            .map(Some)
    }

    pub(super) fn resize_small(
        &mut self,
        flags: HeapFlags,
        arena: usize,
        header: ArenaHeader,
        new_size: usize,
        rounded: usize,
    ) -> Result<usize, HeapError> {
        let ptr = arena + INUSE_HEADER_SIZE;
        let unused = live_unused(ptr, header)?;
        let old_size = header.size - unused;
        self.verify_tail(flags, ptr, old_size..header.size)?;

        let final_data = if rounded > header.size {
            match self.grow_in_place(arena, header, rounded)? {
                Some(data) => data,
                None if flags.contains(HeapFlags::REALLOC_IN_PLACE_ONLY) => {
                    return Err(HeapError::NotInPlace { addr: ptr });
                }
                None => return self.move_block(flags, ptr, old_size, new_size),
            }
        } else {
            self.shrink_block(arena, rounded, MIN_SHRINK_SIZE, true)?
        };

        let current = self.subheaps.read_header(arena)?;
        self.subheaps.write_header(
            arena,
            &ArenaHeader::in_use(final_data, final_data - new_size, current.prev_free),
        )?;
        self.init_user_range(flags, ptr, old_size..new_size)?;
        self.mark_tail(flags, ptr, new_size..final_data)?;
        self.live_bytes = self.live_bytes - old_size + new_size;
        self.note(
            HeapLogLevel::Trace,
            "resize",
            "realloc_in_place",
            Some(ptr),
            Some(new_size),
            "success",
            format!("old_size={old_size}"),
        );
        Ok(ptr)
    }
}
