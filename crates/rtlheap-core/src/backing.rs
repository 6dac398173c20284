//! Backing store: page reservation and commit.
//!
//! The heap never touches host memory directly. Every subheap and large block
//! owns a [`Region`] handed out by a [`BackingStore`]; the region carries the
//! committed bytes of its reservation and the virtual base address the heap
//! uses when it hands pointers to callers.

use parking_lot::Mutex;

use crate::error::HeapError;

/// Granularity of reservations (64 KiB).
pub const ALLOCATION_GRANULARITY: usize = 0x1_0000;

/// Granularity of commits.
pub const PAGE_SIZE: usize = 0x1000;

/// First address handed out by [`VirtualMemory`].
const ADDRESS_SPACE_BASE: usize = 0x1_0000;

/// Rounds `value` up to a power-of-two `align`, or `None` on overflow.
pub(crate) const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// A reserved range of virtual addresses with a committed prefix.
#[derive(Debug)]
pub struct Region {
    base: usize,
    reserved: usize,
    bytes: Vec<u8>,
}

impl Region {
    /// Creates an empty (fully uncommitted) region.
    pub fn new(base: usize, reserved: usize) -> Self {
        Self {
            base,
            reserved,
            bytes: Vec::new(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Number of committed bytes, always a prefix of the reservation.
    pub fn committed(&self) -> usize {
        self.bytes.len()
    }

    /// One past the last reserved address.
    pub fn end(&self) -> usize {
        self.base + self.reserved
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Grows (zero-filled) or shrinks the committed prefix to `len` bytes.
    pub fn set_committed(&mut self, len: usize) -> Result<(), HeapError> {
        if len > self.reserved {
            return Err(HeapError::InvalidParameter("commit beyond reservation"));
        }
        let current = self.bytes.len();
        if len > current {
            self.bytes
                .try_reserve_exact(len - current)
                .map_err(|_| HeapError::Exhausted { requested: len })?;
            self.bytes.resize(len, 0);
        } else {
            self.bytes.truncate(len);
            self.bytes.shrink_to_fit();
        }
        Ok(())
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Reserved/committed accounting reported by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackingStats {
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    pub peak_committed_bytes: usize,
    pub regions: usize,
}

/// Virtual-memory service consumed by the heap.
pub trait BackingStore: Send + Sync {
    /// Reserves at least `size` bytes of address space.
    fn reserve(&self, size: usize) -> Result<Region, HeapError>;
    /// Makes `[0, upto)` of the region usable. New bytes read as zero.
    fn commit(&self, region: &mut Region, upto: usize) -> Result<(), HeapError>;
    /// Discards `[from, committed)`.
    fn decommit(&self, region: &mut Region, from: usize);
    /// Returns the whole reservation.
    fn release(&self, region: Region);
    fn stats(&self) -> BackingStats;
}

#[derive(Debug)]
struct VmState {
    next_base: usize,
    stats: BackingStats,
}

/// Simulated address space with optional reservation and commit limits.
#[derive(Debug)]
pub struct VirtualMemory {
    reserve_limit: Option<usize>,
    commit_limit: Option<usize>,
    state: Mutex<VmState>,
}

impl VirtualMemory {
    pub fn new() -> Self {
        Self {
            reserve_limit: None,
            commit_limit: None,
            state: Mutex::new(VmState {
                next_base: ADDRESS_SPACE_BASE,
                stats: BackingStats::default(),
            }),
        }
    }

    /// Caps the total reserved bytes.
    #[must_use]
    pub fn with_reserve_limit(mut self, limit: usize) -> Self {
        self.reserve_limit = Some(limit);
        self
    }

    /// Caps the total committed bytes.
    #[must_use]
    pub fn with_commit_limit(mut self, limit: usize) -> Self {
        self.commit_limit = Some(limit);
        self
    }
}

impl Default for VirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for VirtualMemory {
    fn reserve(&self, size: usize) -> Result<Region, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidParameter("zero-sized reservation"));
        }
        let exhausted = HeapError::Exhausted { requested: size };
        let rounded = align_up(size, ALLOCATION_GRANULARITY).ok_or(exhausted.clone())?;
        let mut state = self.state.lock();
        let total = state
            .stats
            .reserved_bytes
            .checked_add(rounded)
            .ok_or(exhausted.clone())?;
        if self.reserve_limit.is_some_and(|limit| total > limit) {
            return Err(exhausted);
        }
        let base = state.next_base;
        // One unreserved granule between regions keeps stray pointers out of neighbors.
        let next = base
            .checked_add(rounded)
            .and_then(|v| v.checked_add(ALLOCATION_GRANULARITY))
            .ok_or(exhausted)?;
        state.next_base = next;
        state.stats.reserved_bytes = total;
        state.stats.regions += 1;
        Ok(Region::new(base, rounded))
    }

    fn commit(&self, region: &mut Region, upto: usize) -> Result<(), HeapError> {
        let upto = align_up(upto, PAGE_SIZE)
            .unwrap_or(usize::MAX)
            .min(region.reserved());
        let current = region.committed();
        if upto <= current {
            return Ok(());
        }
        let delta = upto - current;
        let mut state = self.state.lock();
        let total = state.stats.committed_bytes + delta;
        if self.commit_limit.is_some_and(|limit| total > limit) {
            return Err(HeapError::Exhausted { requested: delta });
        }
        region.set_committed(upto)?;
        state.stats.committed_bytes = total;
        state.stats.peak_committed_bytes = state.stats.peak_committed_bytes.max(total);
        Ok(())
    }

    fn decommit(&self, region: &mut Region, from: usize) {
        let from = align_up(from, PAGE_SIZE).unwrap_or(usize::MAX);
        let current = region.committed();
        if from >= current {
            return;
        }
        if region.set_committed(from).is_ok() {
            let mut state = self.state.lock();
            state.stats.committed_bytes -= current - from;
        }
    }

    fn release(&self, region: Region) {
        let mut state = self.state.lock();
        state.stats.reserved_bytes -= region.reserved();
        state.stats.committed_bytes -= region.committed();
        state.stats.regions -= 1;
    }

    fn stats(&self) -> BackingStats {
        self.state.lock().stats
    }
}
