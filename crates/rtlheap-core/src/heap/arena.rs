//! Arena coder.
//!
//! Every block inside a subheap starts with an 8-byte header placed so that
//! the data that follows is 16-byte aligned:
//!
//! ```text
//! in-use:  | size:u32 | magic:24 unused:8 | data ...
//! free:    | size:u32 | FREE_MAGIC:u32    | next:u64 | prev:u64 | ... | back:u64 |
//! large:   | data_size:u64 | block_size:u64 | pad:24 | SENTINEL:u32 | LARGE_MAGIC:u32 | data ...
//! ```
//!
//! `size` counts the data bytes after the 8-byte header, so the next header
//! always sits at `addr + 8 + size`. Its two low bits carry `FLAG_FREE` and
//! `FLAG_PREV_FREE`. A free block that is not last in its subheap stores the
//! address of its own header in its final 8 bytes so the following block can
//! find it. Large blocks end their header with the same 8-byte shape, which
//! lets a user pointer be classified by looking at `ptr - 8` alone.

use crate::error::{CorruptionKind, HeapError};

pub const ALIGNMENT: usize = 16;
pub const INUSE_HEADER_SIZE: usize = 8;
/// Distance from an aligned address to the header that precedes data.
pub const ARENA_OFFSET: usize = ALIGNMENT - INUSE_HEADER_SIZE;
/// Header plus free-list links.
pub const FREE_HEADER_SIZE: usize = 24;
pub const LARGE_HEADER_SIZE: usize = 48;
pub const MIN_DATA_SIZE: usize = 40;
pub const MIN_ARENA_SIZE: usize = MIN_DATA_SIZE + INUSE_HEADER_SIZE;
/// Smallest tail worth splitting off when a block shrinks in place.
pub const MIN_SHRINK_SIZE: usize = 64;
/// Guard bytes added when tail checking is enabled.
pub const TAIL_EXTRA_SIZE: usize = ALIGNMENT;

pub const FLAG_FREE: u32 = 0x1;
pub const FLAG_PREV_FREE: u32 = 0x2;
pub const SIZE_MASK: u32 = !0x3;

pub const INUSE_MAGIC: u32 = 0x45_5355;
pub const PENDING_MAGIC: u32 = 0xbe_dead;
pub const FREE_MAGIC: u32 = 0x4545_5246;
pub const LARGE_MAGIC: u32 = 0x6752_614c;
pub const LARGE_SIZE_SENTINEL: u32 = 0xfedc_ba90;
pub const SUBHEAP_MAGIC: u32 = u32::from_le_bytes(*b"SUBH");
pub const HEAP_MAGIC: u32 = u32::from_le_bytes(*b"HEAP");

pub const INUSE_FILLER: u8 = 0x55;
pub const TAIL_FILLER: u8 = 0xab;
pub const FREE_FILLER: u32 = 0xfeee_feee;

const MAGIC_MASK: u32 = 0xff_ffff;
const MAX_UNUSED: usize = 0xff;

const fn round_header(size: usize) -> usize {
    ((size + ALIGNMENT - 1) & !(ALIGNMENT - 1)) + ARENA_OFFSET
}

pub const SUBHEAP_HEADER_SIZE: usize = round_header(64);
/// The first subheap also carries the heap header.
pub const FIRST_SUBHEAP_HEADER_SIZE: usize = round_header(96);
pub const SUBHEAP_RECORD_SIZE: usize = 32;
pub const HEAP_HEADER_OFFSET: usize = SUBHEAP_RECORD_SIZE;
pub const HEAP_RECORD_SIZE: usize = 16;

/// Data size of a block able to hold `size` user bytes, or `None` on overflow.
pub fn round_size(size: usize, tail_checking: bool) -> Option<usize> {
    let aligned = size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    let mut rounded = aligned.checked_add(ARENA_OFFSET)?;
    if tail_checking {
        rounded = rounded.checked_add(TAIL_EXTRA_SIZE)?;
    }
    Some(rounded.max(MIN_DATA_SIZE))
}

/// Free filler byte expected at `addr`.
pub fn free_filler_byte(addr: usize) -> u8 {
    FREE_FILLER.to_le_bytes()[addr & 3]
}

fn word32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn word64(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn put32(raw: &mut [u8], at: usize, value: u32) {
    raw[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put64(raw: &mut [u8], at: usize, value: u64) {
    raw[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// What a subheap block currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaState {
    InUse { unused: usize },
    /// Freed but parked in the delayed-free ring.
    Pending { unused: usize },
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaHeader {
    /// Data bytes after the header.
    pub size: usize,
    pub prev_free: bool,
    pub state: ArenaState,
}

impl ArenaHeader {
    pub fn in_use(size: usize, unused: usize, prev_free: bool) -> Self {
        Self {
            size,
            prev_free,
            state: ArenaState::InUse { unused },
        }
    }

    pub fn free(size: usize) -> Self {
        Self {
            size,
            prev_free: false,
            state: ArenaState::Free,
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == ArenaState::Free
    }

    /// Header plus data.
    pub fn total_size(&self) -> usize {
        self.size + INUSE_HEADER_SIZE
    }

    pub fn decode(addr: usize, raw: [u8; INUSE_HEADER_SIZE]) -> Result<Self, HeapError> {
        let word0 = word32(&raw, 0);
        let word1 = word32(&raw, 4);
        let size = (word0 & SIZE_MASK) as usize;
        let prev_free = word0 & FLAG_PREV_FREE != 0;
        let state = if word0 & FLAG_FREE != 0 {
            if word1 != FREE_MAGIC {
                return Err(HeapError::corruption(addr, CorruptionKind::BadFreeMagic));
            }
            ArenaState::Free
        } else {
            let unused = (word1 >> 24) as usize;
            match word1 & MAGIC_MASK {
                INUSE_MAGIC => ArenaState::InUse { unused },
                PENDING_MAGIC => ArenaState::Pending { unused },
                _ => return Err(HeapError::corruption(addr, CorruptionKind::BadInUseMagic)),
            }
        };
        if let ArenaState::InUse { unused } | ArenaState::Pending { unused } = state {
            if unused > size {
                return Err(HeapError::corruption(addr, CorruptionKind::BadInUseMagic));
            }
        }
        if size < MIN_DATA_SIZE {
            return Err(HeapError::corruption(addr, CorruptionKind::OutOfBounds));
        }
        Ok(Self {
            size,
            prev_free,
            state,
        })
    }

    pub fn encode(&self) -> [u8; INUSE_HEADER_SIZE] {
        debug_assert!(self.size <= SIZE_MASK as usize && self.size % 4 == 0);
        let mut word0 = (self.size as u32) & SIZE_MASK;
        if self.prev_free {
            word0 |= FLAG_PREV_FREE;
        }
        let word1 = match self.state {
            ArenaState::Free => {
                word0 |= FLAG_FREE;
                FREE_MAGIC
            }
            ArenaState::InUse { unused } => {
                debug_assert!(unused <= MAX_UNUSED);
                INUSE_MAGIC | ((unused.min(MAX_UNUSED) as u32) << 24)
            }
            ArenaState::Pending { unused } => {
                PENDING_MAGIC | ((unused.min(MAX_UNUSED) as u32) << 24)
            }
        };
        let mut raw = [0u8; INUSE_HEADER_SIZE];
        put32(&mut raw, 0, word0);
        put32(&mut raw, 4, word1);
        raw
    }
}

/// Free-list links stored right after a free header. Zero means none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeLinks {
    pub next: usize,
    pub prev: usize,
}

impl FreeLinks {
    pub const SIZE: usize = 16;

    pub fn decode(raw: [u8; Self::SIZE]) -> Self {
        Self {
            next: word64(&raw, 0) as usize,
            prev: word64(&raw, 8) as usize,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        put64(&mut raw, 0, self.next as u64);
        put64(&mut raw, 8, self.prev as u64);
        raw
    }
}

/// Header of a dedicated large-block region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeHeader {
    pub data_size: usize,
    /// Committed bytes of the region, header included.
    pub block_size: usize,
}

impl LargeHeader {
    pub fn decode(addr: usize, raw: [u8; LARGE_HEADER_SIZE]) -> Result<Self, HeapError> {
        if word32(&raw, 40) != LARGE_SIZE_SENTINEL || word32(&raw, 44) != LARGE_MAGIC {
            return Err(HeapError::corruption(addr, CorruptionKind::BadLargeMagic));
        }
        let data_size = word64(&raw, 0) as usize;
        let block_size = word64(&raw, 8) as usize;
        if block_size < LARGE_HEADER_SIZE || data_size > block_size - LARGE_HEADER_SIZE {
            return Err(HeapError::corruption(addr, CorruptionKind::BadLargeMagic));
        }
        Ok(Self {
            data_size,
            block_size,
        })
    }

    pub fn encode(&self) -> [u8; LARGE_HEADER_SIZE] {
        let mut raw = [0u8; LARGE_HEADER_SIZE];
        put64(&mut raw, 0, self.data_size as u64);
        put64(&mut raw, 8, self.block_size as u64);
        put32(&mut raw, 40, LARGE_SIZE_SENTINEL);
        put32(&mut raw, 44, LARGE_MAGIC);
        raw
    }
}

/// Signature at the start of every subheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubheapRecord {
    pub owner: u64,
    pub base: usize,
    pub reserved: usize,
}

impl SubheapRecord {
    pub fn decode(addr: usize, raw: [u8; SUBHEAP_RECORD_SIZE]) -> Result<Self, HeapError> {
        if word32(&raw, 0) != SUBHEAP_MAGIC {
            return Err(HeapError::corruption(addr, CorruptionKind::BadSignature));
        }
        Ok(Self {
            owner: word64(&raw, 8),
            base: word64(&raw, 16) as usize,
            reserved: word64(&raw, 24) as usize,
        })
    }

    pub fn encode(&self) -> [u8; SUBHEAP_RECORD_SIZE] {
        let mut raw = [0u8; SUBHEAP_RECORD_SIZE];
        put32(&mut raw, 0, SUBHEAP_MAGIC);
        put64(&mut raw, 8, self.owner);
        put64(&mut raw, 16, self.base as u64);
        put64(&mut raw, 24, self.reserved as u64);
        raw
    }
}

/// Heap signature stored in the first subheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRecord {
    pub flags: u32,
    pub owner: u64,
}

impl HeapRecord {
    pub fn decode(addr: usize, raw: [u8; HEAP_RECORD_SIZE]) -> Result<Self, HeapError> {
        if word32(&raw, 0) != HEAP_MAGIC {
            return Err(HeapError::corruption(addr, CorruptionKind::BadSignature));
        }
        Ok(Self {
            flags: word32(&raw, 4),
            owner: word64(&raw, 8),
        })
    }

    pub fn encode(&self) -> [u8; HEAP_RECORD_SIZE] {
        let mut raw = [0u8; HEAP_RECORD_SIZE];
        put32(&mut raw, 0, HEAP_MAGIC);
        put32(&mut raw, 4, self.flags);
        put64(&mut raw, 8, self.owner);
        raw
    }
}
