//! Heap flag words.

use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitmask of heap flags, with the historical bit values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HeapFlags(u32);

impl HeapFlags {
    pub const NONE: Self = Self(0);
    /// Skip the per-heap lock (honored at creation only).
    pub const NO_SERIALIZE: Self = Self(0x1);
    /// The heap may acquire more subheaps and large blocks.
    pub const GROWABLE: Self = Self(0x2);
    /// Escalate out-of-memory failures to [`crate::HeapError::Fatal`].
    pub const GENERATE_EXCEPTIONS: Self = Self(0x4);
    /// Zero-fill new allocations.
    pub const ZERO_MEMORY: Self = Self(0x8);
    /// Forbid relocation during resize.
    pub const REALLOC_IN_PLACE_ONLY: Self = Self(0x10);
    /// Append guard bytes after user data.
    pub const TAIL_CHECKING_ENABLED: Self = Self(0x20);
    /// Fill freed blocks and delay their reuse.
    pub const FREE_CHECKING_ENABLED: Self = Self(0x40);

    /// Flags accepted by heap creation.
    pub const CREATE_MASK: Self = Self(0x1 | 0x2 | 0x4 | 0x8 | 0x20 | 0x40);
    /// Flags accepted per allocation.
    pub const ALLOC_MASK: Self = Self(0x4 | 0x1 | 0x8);
    /// Flags accepted per resize.
    pub const REALLOC_MASK: Self = Self(0x4 | 0x1 | 0x8 | 0x10);
    /// Flags accepted by free, size, validate and compact.
    pub const FREE_MASK: Self = Self(0x1);

    const KNOWN: u32 = 0x7f;

    /// Builds flags from a raw word, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::KNOWN)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Call flags restricted to `allow`, OR'ed with the heap's creation flags.
    #[must_use]
    pub const fn effective(call: Self, allow: Self, creation: Self) -> Self {
        Self((call.0 & allow.0) | creation.0)
    }
}

impl BitOr for HeapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for HeapFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for HeapFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_restricts_call_flags() {
        let creation = HeapFlags::GROWABLE | HeapFlags::TAIL_CHECKING_ENABLED;
        let call = HeapFlags::ZERO_MEMORY | HeapFlags::REALLOC_IN_PLACE_ONLY;
        let eff = HeapFlags::effective(call, HeapFlags::ALLOC_MASK, creation);
        assert!(eff.contains(HeapFlags::ZERO_MEMORY));
        assert!(!eff.contains(HeapFlags::REALLOC_IN_PLACE_ONLY));
        assert!(eff.contains(HeapFlags::GROWABLE | HeapFlags::TAIL_CHECKING_ENABLED));

        let eff = HeapFlags::effective(call, HeapFlags::REALLOC_MASK, creation);
        assert!(eff.contains(HeapFlags::REALLOC_IN_PLACE_ONLY));
    }

    #[test]
    fn free_mask_only_keeps_no_serialize() {
        let eff = HeapFlags::effective(
            HeapFlags::from_bits_truncate(u32::MAX),
            HeapFlags::FREE_MASK,
            HeapFlags::NONE,
        );
        assert_eq!(eff, HeapFlags::NO_SERIALIZE);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        assert_eq!(HeapFlags::from_bits_truncate(0x1_0008).bits(), 0x8);
        assert!(HeapFlags::NONE.is_empty());
        let flags = HeapFlags::ZERO_MEMORY | HeapFlags::GROWABLE;
        assert_eq!(flags.without(HeapFlags::ZERO_MEMORY), HeapFlags::GROWABLE);
    }
}
