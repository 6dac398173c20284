//! Process-wide default heap and its backing store.

use std::sync::{Arc, OnceLock};

use crate::backing::{BackingStore, VirtualMemory};
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::flags::HeapFlags;
use crate::sync::SyncHeap;

static STORE: OnceLock<Arc<VirtualMemory>> = OnceLock::new();
static PROCESS_HEAP: OnceLock<Result<SyncHeap, HeapError>> = OnceLock::new();

/// Backing store shared by every heap created without an explicit one.
pub fn default_store() -> Arc<dyn BackingStore> {
    STORE.get_or_init(|| Arc::new(VirtualMemory::new())).clone()
}

/// The process heap: growable, serialized, configured from the environment,
/// created on first use and never destroyed.
pub fn process_heap() -> Result<&'static SyncHeap, HeapError> {
    PROCESS_HEAP
        .get_or_init(|| {
            crate::heap::HeapCore::create(
                HeapFlags::GROWABLE,
                0,
                0,
                HeapConfig::from_env(),
                default_store(),
            )
            .map(SyncHeap::new)
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// True if `heap` is the process heap.
pub fn is_process_heap(heap: &SyncHeap) -> bool {
    PROCESS_HEAP
        .get()
        .and_then(|created| created.as_ref().ok())
        .is_some_and(|process| std::ptr::eq(process, heap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::HeapOps;

    #[test]
    fn process_heap_is_a_singleton() {
        let a = process_heap().unwrap();
        let b = process_heap().unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(is_process_heap(a));
        assert!(a.flags().contains(HeapFlags::GROWABLE));
    }

    #[test]
    fn process_heap_serves_allocations() {
        let heap = process_heap().unwrap();
        let ptr = heap.allocate(HeapFlags::ZERO_MEMORY, 128).unwrap();
        let mut buf = [0xffu8; 128];
        heap.read(ptr, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
}
