//! Heap error taxonomy.
//!
//! Four families of failure are distinguished: exhaustion of the backing
//! store, arithmetic overflow while rounding a request, metadata corruption,
//! and invalid arguments. `Fatal` wraps any of them when the caller (or the
//! heap's corruption policy) asked for failures to be escalated instead of
//! returned as ordinary errors.

use std::fmt;

use thiserror::Error;

/// NT status: not enough virtual memory or paging file quota.
pub const STATUS_NO_MEMORY: u32 = 0xC000_0017;
/// NT status: an invalid parameter was passed.
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
/// NT status: an invalid handle was specified.
pub const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;
/// NT status: a heap has been corrupted.
pub const STATUS_HEAP_CORRUPTION: u32 = 0xC000_0374;
/// NT status: no more entries are available from an enumeration.
pub const STATUS_NO_MORE_ENTRIES: u32 = 0x8000_001A;
/// NT status: the heap cannot be destroyed because it is the process heap.
pub const STATUS_INVALID_HEAP_DESTROY: u32 = 0xC000_0022;
/// NT status: success.
pub const STATUS_SUCCESS: u32 = 0;

/// What exactly was found damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionKind {
    /// Header of an allocated block does not carry the in-use magic.
    BadInUseMagic,
    /// Header of a free block does not carry the free magic.
    BadFreeMagic,
    /// Large-block header does not carry the large magic or size sentinel.
    BadLargeMagic,
    /// A free block is followed by a block whose PREV_FREE flag is clear,
    /// or a block claims a free predecessor that is not there.
    FlagParity,
    /// The back pointer stored before a block does not name its free predecessor.
    BadBackPointer,
    /// Two adjacent blocks are both free.
    AdjacentFree,
    /// A free-list link points outside the heap or at a non-free block.
    BadFreeListLink,
    /// A free block sits in a bucket that does not match its size.
    WrongBucket,
    /// The guard bytes after the user data were overwritten.
    TailGuard,
    /// A freed block was written to after it was released.
    WriteAfterFree,
    /// The block was already freed.
    DoubleFree,
    /// A subheap or heap signature was damaged.
    BadSignature,
    /// A block size runs past the end of its subheap or committed range.
    OutOfBounds,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BadInUseMagic => "bad in-use magic",
            Self::BadFreeMagic => "bad free magic",
            Self::BadLargeMagic => "bad large-block magic",
            Self::FlagParity => "previous-free flag mismatch",
            Self::BadBackPointer => "bad free back pointer",
            Self::AdjacentFree => "adjacent free blocks",
            Self::BadFreeListLink => "bad free-list link",
            Self::WrongBucket => "free block in wrong bucket",
            Self::TailGuard => "tail guard overwritten",
            Self::WriteAfterFree => "write after free",
            Self::DoubleFree => "double free",
            Self::BadSignature => "bad heap signature",
            Self::OutOfBounds => "block out of bounds",
        };
        f.write_str(text)
    }
}

/// Errors reported by heap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The backing store refused a reservation or commit.
    #[error("out of memory: {requested} bytes requested")]
    Exhausted { requested: usize },
    /// The requested size does not survive rounding.
    #[error("size {requested} overflows when rounded")]
    Overflow { requested: usize },
    /// Heap metadata failed a consistency check.
    #[error("heap corruption at {addr:#x}: {kind}")]
    Corruption { addr: usize, kind: CorruptionKind },
    /// The pointer does not name a block of this heap.
    #[error("pointer {addr:#x} does not belong to this heap")]
    InvalidPointer { addr: usize },
    /// An argument was rejected before touching heap metadata.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// A resize that forbids relocation could not be satisfied in place.
    #[error("block at {addr:#x} cannot be resized in place")]
    NotInPlace { addr: usize },
    /// The process heap cannot be destroyed.
    #[error("the process heap cannot be destroyed")]
    ProcessHeap,
    /// The failure was escalated and must not be ignored.
    #[error("fatal heap failure: {0}")]
    Fatal(Box<HeapError>),
}

impl HeapError {
    /// Wraps `self` in [`HeapError::Fatal`] unless it already is.
    #[must_use]
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Fatal(_) => self,
            other => Self::Fatal(Box::new(other)),
        }
    }

    /// Returns true for escalated failures.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Returns true if the error reports damaged metadata.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Corruption { .. } => true,
            Self::Fatal(inner) => inner.is_corruption(),
            _ => false,
        }
    }

    /// The error with any `Fatal` wrapper removed.
    #[must_use]
    pub fn root(&self) -> &HeapError {
        match self {
            Self::Fatal(inner) => inner.root(),
            other => other,
        }
    }

    /// NT status code recorded as the last error for this failure.
    #[must_use]
    pub fn status(&self) -> u32 {
        match self {
            Self::Exhausted { .. } | Self::Overflow { .. } | Self::NotInPlace { .. } => {
                STATUS_NO_MEMORY
            }
            Self::Corruption { .. } => STATUS_HEAP_CORRUPTION,
            Self::InvalidPointer { .. } | Self::InvalidParameter(_) => STATUS_INVALID_PARAMETER,
            Self::ProcessHeap => STATUS_INVALID_HEAP_DESTROY,
            Self::Fatal(inner) => inner.status(),
        }
    }

    pub(crate) fn corruption(addr: usize, kind: CorruptionKind) -> Self {
        Self::Corruption { addr, kind }
    }
}
