//! Delayed-free ring.
//!
//! With free checking enabled, freed blocks are filled, tagged pending and
//! parked here instead of being returned to the free lists. When the ring
//! overflows, the oldest block is verified and released.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct PendingRing {
    slots: VecDeque<usize>,
    capacity: usize,
}

impl PendingRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Parks `arena`; returns the evicted oldest arena when the ring was full.
    /// A zero-capacity ring hands `arena` straight back.
    pub fn push(&mut self, arena: usize) -> Option<usize> {
        if self.capacity == 0 {
            return Some(arena);
        }
        self.slots.push_back(arena);
        if self.slots.len() > self.capacity {
            self.slots.pop_front()
        } else {
            None
        }
    }

    pub fn pop_oldest(&mut self) -> Option<usize> {
        self.slots.pop_front()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &usize> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_in_fifo_order() {
        let mut ring = PendingRing::new(2);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), Some(1));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop_oldest(), Some(2));
        assert_eq!(ring.pop_oldest(), Some(3));
        assert!(ring.is_empty());
    }

    #[test]
    fn zero_capacity_passes_through() {
        let mut ring = PendingRing::new(0);
        assert_eq!(ring.push(7), Some(7));
        assert!(ring.is_empty());
    }
}
