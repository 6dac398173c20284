//! Heap engine.
//!
//! [`HeapCore`] is the single-threaded engine behind every heap variant. It
//! owns the subheaps, the large blocks, the free lists and the delayed-free
//! ring, and implements every public operation on `&mut self`.
//! Serialization is layered on top by [`crate::sync`].

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backing::BackingStore;
use crate::config::{CorruptionPolicy, HeapConfig, ValidateMode};
use crate::error::{CorruptionKind, HeapError};
use crate::flags::HeapFlags;
use crate::log::{HeapLog, HeapLogLevel, HeapLogRecord};

use super::arena::{
    self, ALIGNMENT, ArenaHeader, ArenaState, INUSE_FILLER, INUSE_HEADER_SIZE, TAIL_EXTRA_SIZE,
    TAIL_FILLER,
};
use super::free_list::FreeLists;
use super::large::LargeBlocks;
use super::pending::PendingRing;
use super::subheap::{self, MAX_SUBHEAP_SIZE, SubheapSet, SubheapSpec};

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// Heap information classes for query/set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapInformation {
    /// Front-end allocator kind; always 0 (standard heap).
    Compatibility,
    /// Setting it escalates every detected corruption to a fatal failure.
    EnableTerminationOnCorruption,
}

impl HeapInformation {
    pub fn from_raw(class: u32) -> Option<Self> {
        match class {
            0 => Some(Self::Compatibility),
            1 => Some(Self::EnableTerminationOnCorruption),
            _ => None,
        }
    }
}

/// Point-in-time accounting for one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapSummary {
    pub committed: usize,
    pub reserved: usize,
    /// Live user bytes.
    pub allocated: usize,
    pub live_blocks: usize,
    /// Data bytes of free subheap arenas, uncommitted tails included.
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub pending_blocks: usize,
    pub subheaps: usize,
    pub large_blocks: usize,
}

/// Where a caller pointer landed.
#[derive(Debug, Clone, Copy)]
pub(super) enum Located {
    Small { arena: usize, header: ArenaHeader },
    Large { ptr: usize },
}

/// Unused bytes of a live small block, or a double free.
pub(super) fn live_unused(ptr: usize, header: ArenaHeader) -> Result<usize, HeapError> {
    match header.state {
        ArenaState::InUse { unused } => Ok(unused),
        ArenaState::Pending { .. } | ArenaState::Free => {
            Err(HeapError::corruption(ptr, CorruptionKind::DoubleFree))
        }
    }
}

pub struct HeapCore {
    pub(super) id: u64,
    pub(super) flags: HeapFlags,
    pub(super) config: HeapConfig,
    pub(super) store: Arc<dyn BackingStore>,
    pub(super) subheaps: SubheapSet,
    pub(super) large: LargeBlocks,
    pub(super) free_lists: FreeLists,
    pub(super) pending: PendingRing,
    /// Reservation size tried for the next subheap.
    pub(super) grow_size: usize,
    /// Size a non-growable heap was created with.
    pub(super) fixed_size: Option<usize>,
    pub(super) log: HeapLog,
    pub(super) live_blocks: usize,
    pub(super) live_bytes: usize,
    /// Bumped by every mutation; walk cursors use it to resynchronize.
    pub(super) generation: u64,
}

impl fmt::Debug for HeapCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapCore")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("subheaps", &self.subheaps.len())
            .field("large_blocks", &self.large.len())
            .field("live_blocks", &self.live_blocks)
            .field("live_bytes", &self.live_bytes)
            .finish()
    }
}

impl HeapCore {
    /// Creates a heap.
    ///
    /// `initial_size` is the size committed up front and `max_size` the
    /// reservation of the first subheap. If either is zero the heap is
    /// growable and the first reservation is at least
    /// `config.default_subheap_size`; otherwise the heap is fixed at
    /// `max_size` unless `GROWABLE` is passed. A fixed heap's arena space
    /// ends `max_size` bytes past its header even though the reservation is
    /// rounded up to the allocation granularity.
    pub fn create(
        flags: HeapFlags,
        initial_size: usize,
        max_size: usize,
        config: HeapConfig,
        store: Arc<dyn BackingStore>,
    ) -> Result<Self, HeapError> {
        let mut flags = flags & HeapFlags::CREATE_MASK;
        let (commit, reserve) = if initial_size == 0 || max_size == 0 {
            flags |= HeapFlags::GROWABLE;
            (
                initial_size,
                config.default_subheap_size.max(initial_size).max(max_size),
            )
        } else {
            (initial_size.min(max_size), max_size)
        };
        if reserve > MAX_SUBHEAP_SIZE {
            return Err(HeapError::Overflow { requested: reserve });
        }
        let fixed_size = (!flags.contains(HeapFlags::GROWABLE)).then_some(reserve);
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        let (sub, arena, data) = subheap::create(
            store.as_ref(),
            SubheapSpec {
                owner: id,
                heap_flags: Some(flags.bits()),
                reserve,
                limit: fixed_size,
                commit,
                commit_granularity: config.commit_granularity,
                free_checking: flags.contains(HeapFlags::FREE_CHECKING_ENABLED),
            },
        )?;
        let base = sub.base();
        let reserved = sub.reserved();
        let grow_size = config.default_subheap_size.max(reserved);
        let log = HeapLog::new(config.log_capacity, config.log_level);
        let pending = PendingRing::new(config.pending_free_slots);
        let mut core = Self {
            id,
            flags,
            config,
            store,
            subheaps: SubheapSet::new(),
            large: LargeBlocks::new(),
            free_lists: FreeLists::new(),
            pending,
            grow_size,
            fixed_size,
            log,
            live_blocks: 0,
            live_bytes: 0,
            generation: 0,
        };
        core.subheaps.push(sub);
        core.free_lists
            .insert(&mut core.subheaps, arena, data + INUSE_HEADER_SIZE, true)?;
        core.note(
            HeapLogLevel::Info,
            "create",
            "create",
            Some(base),
            Some(reserved),
            "success",
            format!("flags={:#x} commit={commit}", flags.bits()),
        );
        Ok(core)
    }

    /// Unique id of this heap, also stamped in its subheap signatures.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Creation flags.
    pub fn flags(&self) -> HeapFlags {
        self.flags
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn corruption_policy(&self) -> CorruptionPolicy {
        self.config.corruption_policy
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(super) fn effective(&self, call: HeapFlags, allow: HeapFlags) -> HeapFlags {
        HeapFlags::effective(call, allow, self.flags)
    }

    /// A fixed heap never holds a block larger than the heap itself.
    fn check_fixed_size(&self, size: usize) -> Result<(), HeapError> {
        match self.fixed_size {
            Some(limit) if size > limit => Err(HeapError::Exhausted { requested: size }),
            _ => Ok(()),
        }
    }

    pub(super) fn free_checking(&self) -> bool {
        self.flags.contains(HeapFlags::FREE_CHECKING_ENABLED)
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn note(
        &mut self,
        level: HeapLogLevel,
        symbol: &'static str,
        event: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        let live = (self.live_blocks, self.live_bytes);
        self.log
            .record(level, symbol, event, addr, size, outcome, details, live);
    }

    /// Logs a failed call and applies the escalation rules.
    fn fail(
        &mut self,
        symbol: &'static str,
        flags: HeapFlags,
        addr: Option<usize>,
        size: Option<usize>,
        err: HeapError,
    ) -> HeapError {
        let (level, event, escalate) = match err.root() {
            HeapError::Exhausted { .. } => (
                HeapLogLevel::Warn,
                "oom",
                flags.contains(HeapFlags::GENERATE_EXCEPTIONS),
            ),
            HeapError::Overflow { .. } => (
                HeapLogLevel::Warn,
                "overflow",
                flags.contains(HeapFlags::GENERATE_EXCEPTIONS),
            ),
            HeapError::NotInPlace { .. } => (
                HeapLogLevel::Info,
                "realloc_not_in_place",
                flags.contains(HeapFlags::GENERATE_EXCEPTIONS),
            ),
            HeapError::Corruption { .. } => (
                HeapLogLevel::Error,
                "corruption_detected",
                self.config.corruption_policy == CorruptionPolicy::Terminate,
            ),
            HeapError::InvalidPointer { .. } => (HeapLogLevel::Warn, "invalid_pointer", false),
            _ => (HeapLogLevel::Warn, "invalid_parameter", false),
        };
        if self.log.enabled(level) {
            let outcome = if escalate { "fatal" } else { "failed" };
            let details = err.to_string();
            self.note(level, symbol, event, addr, size, outcome, details);
        }
        if escalate { err.into_fatal() } else { err }
    }

    /// Whole-heap validation before a mutating call, when configured.
    fn precheck(&self) -> Result<(), HeapError> {
        if self.config.validate_mode == ValidateMode::All {
            self.check_heap()
        } else {
            Ok(())
        }
    }

    /// Classifies a caller pointer by range and header tag.
    pub(super) fn locate(&self, ptr: usize) -> Result<Located, HeapError> {
        let invalid = HeapError::InvalidPointer { addr: ptr };
        if ptr == 0 || ptr % ALIGNMENT != 0 {
            return Err(invalid);
        }
        if let Some(block) = self.large.lookup(ptr) {
            block.header()?;
            return Ok(Located::Large { ptr });
        }
        let index = self.subheaps.locate(ptr).ok_or(invalid.clone())?;
        let sub = self.subheaps.get(index).ok_or(invalid.clone())?;
        if ptr < sub.first_arena() + INUSE_HEADER_SIZE
            || ptr >= sub.committed_end()
            || ptr >= sub.end()
        {
            return Err(invalid);
        }
        let (end, committed_end) = (sub.end(), sub.committed_end());
        let arena = ptr - INUSE_HEADER_SIZE;
        let header = self.subheaps.read_header(arena)?;
        let data_end = ptr + header.size;
        if data_end > end || (!header.is_free() && data_end > committed_end) {
            return Err(HeapError::corruption(arena, CorruptionKind::OutOfBounds));
        }
        Ok(Located::Small { arena, header })
    }

    /// Size the caller asked for when `ptr` was (re)allocated.
    fn live_size(&self, ptr: usize) -> Result<usize, HeapError> {
        if ptr == 0 {
            return Err(HeapError::InvalidParameter("null pointer"));
        }
        match self.locate(ptr)? {
            Located::Large { ptr } => self
                .large
                .lookup(ptr)
                .map(|block| block.data_size())
                .ok_or(HeapError::InvalidPointer { addr: ptr }),
            Located::Small { header, .. } => Ok(header.size - live_unused(ptr, header)?),
        }
    }

    pub(super) fn user_bytes(&self, ptr: usize, range: Range<usize>) -> Result<&[u8], HeapError> {
        if let Some(block) = self.large.lookup(ptr) {
            return block
                .data()
                .get(range)
                .ok_or(HeapError::InvalidParameter("access outside block"));
        }
        self.subheaps.bytes(ptr + range.start, range.len())
    }

    pub(super) fn user_bytes_mut(
        &mut self,
        ptr: usize,
        range: Range<usize>,
    ) -> Result<&mut [u8], HeapError> {
        if let Some(block) = self.large.lookup_mut(ptr) {
            return block
                .data_mut()
                .get_mut(range)
                .ok_or(HeapError::InvalidParameter("access outside block"));
        }
        self.subheaps.bytes_mut(ptr + range.start, range.len())
    }

    /// Zero-fills or marks uninitialized bytes of a fresh range.
    pub(super) fn init_user_range(
        &mut self,
        flags: HeapFlags,
        ptr: usize,
        range: Range<usize>,
    ) -> Result<(), HeapError> {
        if range.is_empty() {
            return Ok(());
        }
        if flags.contains(HeapFlags::ZERO_MEMORY) {
            self.user_bytes_mut(ptr, range)?.fill(0);
        } else if flags.contains(HeapFlags::FREE_CHECKING_ENABLED) {
            self.user_bytes_mut(ptr, range)?.fill(INUSE_FILLER);
        }
        Ok(())
    }

    pub(super) fn mark_tail(
        &mut self,
        flags: HeapFlags,
        ptr: usize,
        range: Range<usize>,
    ) -> Result<(), HeapError> {
        if flags.contains(HeapFlags::TAIL_CHECKING_ENABLED) && !range.is_empty() {
            self.user_bytes_mut(ptr, range)?.fill(TAIL_FILLER);
        }
        Ok(())
    }

    pub(super) fn verify_tail(
        &self,
        flags: HeapFlags,
        ptr: usize,
        range: Range<usize>,
    ) -> Result<(), HeapError> {
        if !flags.contains(HeapFlags::TAIL_CHECKING_ENABLED) || range.is_empty() {
            return Ok(());
        }
        let start = range.start;
        match self
            .user_bytes(ptr, range)?
            .iter()
            .position(|&b| b != TAIL_FILLER)
        {
            Some(i) => Err(HeapError::corruption(
                ptr + start + i,
                CorruptionKind::TailGuard,
            )),
            None => Ok(()),
        }
    }

    /// Guard range of a large block holding `size` bytes.
    pub(super) fn large_tail(size: usize, capacity: usize) -> Range<usize> {
        size..(size + TAIL_EXTRA_SIZE).min(capacity)
    }

    /// Allocates `size` bytes.
    pub fn allocate(&mut self, flags: HeapFlags, size: usize) -> Result<usize, HeapError> {
        let flags = self.effective(flags, HeapFlags::ALLOC_MASK);
        match self.precheck().and_then(|()| self.alloc_block(flags, size)) {
            Ok(ptr) => {
                self.generation += 1;
                Ok(ptr)
            }
            Err(err) => Err(self.fail("allocate", flags, None, Some(size), err)),
        }
    }

    pub(super) fn alloc_block(&mut self, flags: HeapFlags, size: usize) -> Result<usize, HeapError> {
        let tail = flags.contains(HeapFlags::TAIL_CHECKING_ENABLED);
        let rounded =
            arena::round_size(size, tail).ok_or(HeapError::Overflow { requested: size })?;

        if flags.contains(HeapFlags::GROWABLE) && size >= self.config.large_threshold {
            let ptr = self.large.alloc(self.store.as_ref(), size, tail)?;
            let capacity = self
                .large
                .lookup(ptr)
                .map_or(size, |block| block.capacity());
            // Fresh regions are already zero.
            self.init_user_range(flags.without(HeapFlags::ZERO_MEMORY), ptr, 0..size)?;
            self.mark_tail(flags, ptr, Self::large_tail(size, capacity))?;
            self.live_blocks += 1;
            self.live_bytes += size;
            self.note(
                HeapLogLevel::Trace,
                "allocate",
                "alloc_large",
                Some(ptr),
                Some(size),
                "success",
                "path=large_block",
            );
            return Ok(ptr);
        }

        self.check_fixed_size(size)?;
        let (arena, header) = self.take_free_block(flags, size, rounded)?;
        let data = self.carve(arena, header, rounded)?;
        self.subheaps
            .write_header(arena, &ArenaHeader::in_use(data, data - size, false))?;
        let ptr = arena + INUSE_HEADER_SIZE;
        self.init_user_range(flags, ptr, 0..size)?;
        self.mark_tail(flags, ptr, size..data)?;
        self.live_blocks += 1;
        self.live_bytes += size;
        self.note(
            HeapLogLevel::Trace,
            "allocate",
            "alloc",
            Some(ptr),
            Some(size),
            "success",
            "path=free_list",
        );
        Ok(ptr)
    }

    /// Frees `ptr`. A null pointer is a successful no-op.
    pub fn deallocate(&mut self, flags: HeapFlags, ptr: usize) -> Result<(), HeapError> {
        let flags = self.effective(flags, HeapFlags::FREE_MASK);
        if ptr == 0 {
            self.note(
                HeapLogLevel::Trace,
                "free",
                "free_null",
                None,
                None,
                "noop",
                "null_pointer",
            );
            return Ok(());
        }
        match self.precheck().and_then(|()| self.free_block(flags, ptr)) {
            Ok(()) => {
                self.generation += 1;
                Ok(())
            }
            Err(err) => Err(self.fail("free", flags, Some(ptr), None, err)),
        }
    }

    fn free_block(&mut self, flags: HeapFlags, ptr: usize) -> Result<(), HeapError> {
        match self.locate(ptr)? {
            Located::Large { ptr } => {
                let (size, capacity) = self
                    .large
                    .lookup(ptr)
                    .map(|block| (block.data_size(), block.capacity()))
                    .ok_or(HeapError::InvalidPointer { addr: ptr })?;
                self.verify_tail(flags, ptr, Self::large_tail(size, capacity))?;
                self.release_large(ptr);
            }
            Located::Small { arena, header } => {
                let unused = live_unused(ptr, header)?;
                self.verify_tail(flags, ptr, header.size - unused..header.size)?;
                self.release_small(arena, header)?;
            }
        }
        Ok(())
    }

    pub(super) fn release_large(&mut self, ptr: usize) {
        if let Some(block) = self.large.remove(ptr) {
            let size = block.data_size();
            self.store.release(block.into_region());
            self.live_blocks = self.live_blocks.saturating_sub(1);
            self.live_bytes = self.live_bytes.saturating_sub(size);
            self.note(
                HeapLogLevel::Trace,
                "free",
                "free_large",
                Some(ptr),
                Some(size),
                "success",
                "region_released",
            );
        }
    }

    /// Changes the size of the block at `ptr`, moving it unless
    /// `REALLOC_IN_PLACE_ONLY` is in effect.
    pub fn resize(
        &mut self,
        flags: HeapFlags,
        ptr: usize,
        new_size: usize,
    ) -> Result<usize, HeapError> {
        let flags = self.effective(flags, HeapFlags::REALLOC_MASK);
        let result = if ptr == 0 {
            Err(HeapError::InvalidParameter("null pointer"))
        } else {
            self.precheck()
                .and_then(|()| self.resize_block(flags, ptr, new_size))
        };
        match result {
            Ok(new_ptr) => {
                self.generation += 1;
                Ok(new_ptr)
            }
            Err(err) => Err(self.fail("resize", flags, Some(ptr), Some(new_size), err)),
        }
    }

    fn resize_block(
        &mut self,
        flags: HeapFlags,
        ptr: usize,
        new_size: usize,
    ) -> Result<usize, HeapError> {
        let tail = flags.contains(HeapFlags::TAIL_CHECKING_ENABLED);
        let rounded =
            arena::round_size(new_size, tail).ok_or(HeapError::Overflow { requested: new_size })?;
        match self.locate(ptr)? {
            Located::Large { ptr } => self.resize_large(flags, ptr, new_size),
            Located::Small { arena, header } => {
                self.check_fixed_size(new_size)?;
                self.resize_small(flags, arena, header, new_size, rounded)
            }
        }
    }

    fn resize_large(
        &mut self,
        flags: HeapFlags,
        ptr: usize,
        new_size: usize,
    ) -> Result<usize, HeapError> {
        let (old_size, capacity) = self
            .large
            .lookup(ptr)
            .map(|block| (block.data_size(), block.capacity()))
            .ok_or(HeapError::InvalidPointer { addr: ptr })?;
        self.verify_tail(flags, ptr, Self::large_tail(old_size, capacity))?;
        let extra = if flags.contains(HeapFlags::TAIL_CHECKING_ENABLED) {
            TAIL_EXTRA_SIZE
        } else {
            0
        };
        let needed = new_size
            .checked_add(extra)
            .ok_or(HeapError::Overflow { requested: new_size })?;
        if needed <= capacity {
            if let Some(block) = self.large.lookup_mut(ptr) {
                block.set_data_size(new_size);
            }
            self.init_user_range(flags, ptr, old_size..new_size)?;
            self.mark_tail(flags, ptr, Self::large_tail(new_size, capacity))?;
            self.live_bytes = self.live_bytes - old_size + new_size;
            self.note(
                HeapLogLevel::Trace,
                "resize",
                "realloc_in_place",
                Some(ptr),
                Some(new_size),
                "success",
                "path=large_block",
            );
            return Ok(ptr);
        }
        if flags.contains(HeapFlags::REALLOC_IN_PLACE_ONLY) {
            return Err(HeapError::NotInPlace { addr: ptr });
        }
        self.move_block(flags, ptr, old_size, new_size)
    }

    /// Allocates a new block, copies the surviving bytes and frees `ptr`.
    pub(super) fn move_block(
        &mut self,
        flags: HeapFlags,
        ptr: usize,
        old_size: usize,
        new_size: usize,
    ) -> Result<usize, HeapError> {
        let new_ptr = self.alloc_block(flags, new_size)?;
        let copy = old_size.min(new_size);
        let bytes = self.user_bytes(ptr, 0..copy)?.to_vec();
        self.user_bytes_mut(new_ptr, 0..copy)?
            .copy_from_slice(&bytes);
        match self.locate(ptr)? {
            Located::Large { ptr } => self.release_large(ptr),
            Located::Small { arena, header } => self.release_small(arena, header)?,
        }
        self.note(
            HeapLogLevel::Trace,
            "resize",
            "realloc_move",
            Some(new_ptr),
            Some(new_size),
            "success",
            "copied",
        );
        Ok(new_ptr)
    }

    /// Usable size of `ptr`: exactly the size last requested for it.
    pub fn size_of(&mut self, flags: HeapFlags, ptr: usize) -> Result<usize, HeapError> {
        let flags = self.effective(flags, HeapFlags::FREE_MASK);
        let result = self.live_size(ptr);
        result.map_err(|err| self.fail("size_of", flags, Some(ptr), None, err))
    }

    /// Flushes the delayed-free ring and returns the bytes handed back to
    /// the free lists.
    pub fn compact(&mut self, flags: HeapFlags) -> usize {
        let _flags = self.effective(flags, HeapFlags::FREE_MASK);
        let mut reclaimed = 0;
        let mut flushed = 0;
        while let Some(arena) = self.pending.pop_oldest() {
            reclaimed += self.flush_pending(arena);
            flushed += 1;
        }
        if flushed > 0 {
            self.generation += 1;
        }
        self.note(
            HeapLogLevel::Debug,
            "compact",
            "compact",
            None,
            Some(reclaimed),
            "success",
            format!("flushed={flushed}"),
        );
        reclaimed
    }

    fn access_range(&self, ptr: usize, offset: usize, len: usize) -> Result<Range<usize>, HeapError> {
        let size = self.live_size(ptr)?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= size)
            .ok_or(HeapError::InvalidParameter("access outside block"))?;
        Ok(offset..end)
    }

    /// Copies bytes `[offset, offset + buf.len())` of a live block into `buf`.
    pub fn read(&self, ptr: usize, offset: usize, buf: &mut [u8]) -> Result<(), HeapError> {
        let range = self.access_range(ptr, offset, buf.len())?;
        buf.copy_from_slice(self.user_bytes(ptr, range)?);
        Ok(())
    }

    /// Copies `data` into a live block at `offset`.
    pub fn write(&mut self, ptr: usize, offset: usize, data: &[u8]) -> Result<(), HeapError> {
        let range = self.access_range(ptr, offset, data.len())?;
        self.user_bytes_mut(ptr, range)?.copy_from_slice(data);
        Ok(())
    }

    /// Sets `len` bytes of a live block to `byte`.
    pub fn fill(&mut self, ptr: usize, offset: usize, byte: u8, len: usize) -> Result<(), HeapError> {
        let range = self.access_range(ptr, offset, len)?;
        self.user_bytes_mut(ptr, range)?.fill(byte);
        Ok(())
    }

    pub fn summary(&self) -> HeapSummary {
        let mut summary = HeapSummary {
            allocated: self.live_bytes,
            live_blocks: self.live_blocks,
            pending_blocks: self.pending.len(),
            subheaps: self.subheaps.len(),
            large_blocks: self.large.len(),
            ..HeapSummary::default()
        };
        for sub in self.subheaps.iter() {
            summary.committed += sub.committed();
            summary.reserved += sub.reserved();
            let mut addr = sub.first_arena();
            while addr < sub.end() {
                let Ok(header) = self.subheaps.read_header(addr) else {
                    break;
                };
                if header.is_free() {
                    summary.free_blocks += 1;
                    summary.free_bytes += header.size;
                }
                addr += header.total_size();
            }
        }
        summary.committed += self.large.total_mapped();
        summary.reserved += self.large.iter().map(|block| block.reserved()).sum::<usize>();
        summary
    }

    pub fn query_information(&self, class: HeapInformation) -> Result<u32, HeapError> {
        match class {
            HeapInformation::Compatibility => Ok(0),
            HeapInformation::EnableTerminationOnCorruption => Err(
                HeapError::InvalidParameter("information class cannot be queried"),
            ),
        }
    }

    pub fn set_information(&mut self, class: HeapInformation, value: u32) -> Result<(), HeapError> {
        match class {
            HeapInformation::EnableTerminationOnCorruption => {
                self.config.corruption_policy = CorruptionPolicy::Terminate;
                self.note(
                    HeapLogLevel::Info,
                    "set_information",
                    "policy_change",
                    None,
                    None,
                    "success",
                    "corruption_policy=terminate",
                );
                Ok(())
            }
            HeapInformation::Compatibility if value == 0 => Ok(()),
            HeapInformation::Compatibility => {
                Err(HeapError::InvalidParameter("unsupported compatibility mode"))
            }
        }
    }

    /// Takes the buffered lifecycle records.
    pub fn drain_logs(&mut self) -> Vec<HeapLogRecord> {
        self.log.drain()
    }

    /// Raw write into committed heap memory, bypassing every check.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn poke(&mut self, addr: usize, bytes: &[u8]) -> Result<(), HeapError> {
        if let Some(block) = self.large.containing_mut(addr) {
            let offset = addr - block.base();
            let raw = block.raw_mut();
            let end = offset
                .checked_add(bytes.len())
                .filter(|&end| end <= raw.len())
                .ok_or(HeapError::InvalidParameter("poke outside block"))?;
            raw[offset..end].copy_from_slice(bytes);
            return Ok(());
        }
        self.subheaps.write(addr, bytes)
    }

    /// Releases every subheap and large block and returns the final records.
    pub fn destroy(mut self) -> Vec<HeapLogRecord> {
        self.note(
            HeapLogLevel::Info,
            "destroy",
            "destroy",
            None,
            Some(self.live_bytes),
            "success",
            format!(
                "subheaps={} large_blocks={}",
                self.subheaps.len(),
                self.large.len()
            ),
        );
        self.release_all();
        self.log.drain()
    }

    fn release_all(&mut self) {
        for sub in self.subheaps.take_all() {
            self.store.release(sub.into_region());
        }
        for block in self.large.take_all() {
            self.store.release(block.into_region());
        }
        self.pending = PendingRing::new(self.config.pending_free_slots);
        self.free_lists = FreeLists::new();
        self.live_blocks = 0;
        self.live_bytes = 0;
    }
}

impl Drop for HeapCore {
    fn drop(&mut self) {
        self.release_all();
    }
}
