//! Serialized and unserialized heap front-ends.
//!
//! Every operation runs against a [`HeapCore`] through [`HeapOps::with_core`].
//! A serialized heap takes a recursive heap lock first, so a thread that
//! called [`HeapOps::lock`] keeps working on the heap while every other
//! thread waits. An unserialized heap is a plain `RefCell` and stays on the
//! thread that created it.

use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::backing::BackingStore;
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::flags::HeapFlags;
use crate::heap::{HeapCore, HeapEntry, HeapInformation, HeapSummary, WalkCursor};
use crate::log::HeapLogRecord;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Recursive lock: the owning thread may acquire it again, and must release
/// it as many times as it acquired it.
#[derive(Debug, Default)]
pub struct HeapLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl HeapLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the calling thread owns the lock.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Drops one level of ownership. Returns false if the calling thread
    /// does not own the lock.
    pub fn release(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
        true
    }

    pub fn guard(&self) -> HeapLockGuard<'_> {
        self.acquire();
        HeapLockGuard { lock: self }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

pub struct HeapLockGuard<'a> {
    lock: &'a HeapLock,
}

impl Drop for HeapLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Operations shared by every heap front-end.
pub trait HeapOps {
    /// Runs `f` with exclusive access to the engine.
    fn with_core<R>(&self, f: impl FnOnce(&mut HeapCore) -> R) -> R;

    /// Takes the heap lock for the calling thread until [`HeapOps::unlock`].
    fn lock(&self) -> bool;

    fn unlock(&self) -> bool;

    fn allocate(&self, flags: HeapFlags, size: usize) -> Result<usize, HeapError> {
        self.with_core(|core| core.allocate(flags, size))
    }

    fn deallocate(&self, flags: HeapFlags, ptr: usize) -> Result<(), HeapError> {
        self.with_core(|core| core.deallocate(flags, ptr))
    }

    fn resize(&self, flags: HeapFlags, ptr: usize, new_size: usize) -> Result<usize, HeapError> {
        self.with_core(|core| core.resize(flags, ptr, new_size))
    }

    fn size_of(&self, flags: HeapFlags, ptr: usize) -> Result<usize, HeapError> {
        self.with_core(|core| core.size_of(flags, ptr))
    }

    fn validate(&self, flags: HeapFlags, ptr: Option<usize>) -> bool {
        self.with_core(|core| core.validate(flags, ptr))
    }

    fn walk(&self, cursor: &mut WalkCursor) -> Result<Option<HeapEntry>, HeapError> {
        self.with_core(|core| core.walk(cursor))
    }

    fn compact(&self, flags: HeapFlags) -> usize {
        self.with_core(|core| core.compact(flags))
    }

    fn summary(&self) -> HeapSummary {
        self.with_core(|core| core.summary())
    }

    fn read(&self, ptr: usize, offset: usize, buf: &mut [u8]) -> Result<(), HeapError> {
        self.with_core(|core| core.read(ptr, offset, buf))
    }

    fn write(&self, ptr: usize, offset: usize, data: &[u8]) -> Result<(), HeapError> {
        self.with_core(|core| core.write(ptr, offset, data))
    }

    fn fill(&self, ptr: usize, offset: usize, byte: u8, len: usize) -> Result<(), HeapError> {
        self.with_core(|core| core.fill(ptr, offset, byte, len))
    }

    fn query_information(&self, class: HeapInformation) -> Result<u32, HeapError> {
        self.with_core(|core| core.query_information(class))
    }

    fn set_information(&self, class: HeapInformation, value: u32) -> Result<(), HeapError> {
        self.with_core(|core| core.set_information(class, value))
    }

    fn drain_logs(&self) -> Vec<HeapLogRecord> {
        self.with_core(|core| core.drain_logs())
    }

    fn flags(&self) -> HeapFlags {
        self.with_core(|core| core.flags())
    }

    fn id(&self) -> u64 {
        self.with_core(|core| core.id())
    }

    #[cfg(any(test, feature = "fault-injection"))]
    fn poke(&self, addr: usize, bytes: &[u8]) -> Result<(), HeapError> {
        self.with_core(|core| core.poke(addr, bytes))
    }
}

/// Heap shared between threads.
#[derive(Debug)]
pub struct SyncHeap {
    lock: HeapLock,
    core: Mutex<HeapCore>,
}

impl SyncHeap {
    pub fn new(core: HeapCore) -> Self {
        Self {
            lock: HeapLock::new(),
            core: Mutex::new(core),
        }
    }

    pub fn into_core(self) -> HeapCore {
        self.core.into_inner()
    }
}

impl HeapOps for SyncHeap {
    fn with_core<R>(&self, f: impl FnOnce(&mut HeapCore) -> R) -> R {
        let _guard = self.lock.guard();
        let mut core = self.core.lock();
        f(&mut core)
    }

    fn lock(&self) -> bool {
        self.lock.acquire();
        true
    }

    fn unlock(&self) -> bool {
        self.lock.release()
    }
}

/// Heap created with `NO_SERIALIZE`; confined to one thread.
#[derive(Debug)]
pub struct LocalHeap {
    core: RefCell<HeapCore>,
}

impl LocalHeap {
    pub fn new(core: HeapCore) -> Self {
        Self {
            core: RefCell::new(core),
        }
    }

    pub fn into_core(self) -> HeapCore {
        self.core.into_inner()
    }
}

impl HeapOps for LocalHeap {
    fn with_core<R>(&self, f: impl FnOnce(&mut HeapCore) -> R) -> R {
        f(&mut self.core.borrow_mut())
    }

    fn lock(&self) -> bool {
        true
    }

    fn unlock(&self) -> bool {
        true
    }
}

/// A heap with the front-end its creation flags ask for.
#[derive(Debug)]
pub enum Heap {
    Serialized(SyncHeap),
    Unserialized(LocalHeap),
}

impl Heap {
    pub fn create(
        flags: HeapFlags,
        initial_size: usize,
        max_size: usize,
        config: HeapConfig,
        store: Arc<dyn BackingStore>,
    ) -> Result<Self, HeapError> {
        let core = HeapCore::create(flags, initial_size, max_size, config, store)?;
        Ok(if core.flags().contains(HeapFlags::NO_SERIALIZE) {
            Self::Unserialized(LocalHeap::new(core))
        } else {
            Self::Serialized(SyncHeap::new(core))
        })
    }

    pub fn into_core(self) -> HeapCore {
        match self {
            Self::Serialized(heap) => heap.into_core(),
            Self::Unserialized(heap) => heap.into_core(),
        }
    }
}

impl HeapOps for Heap {
    fn with_core<R>(&self, f: impl FnOnce(&mut HeapCore) -> R) -> R {
        match self {
            Self::Serialized(heap) => heap.with_core(f),
            Self::Unserialized(heap) => heap.with_core(f),
        }
    }

    fn lock(&self) -> bool {
        match self {
            Self::Serialized(heap) => heap.lock(),
            Self::Unserialized(heap) => heap.lock(),
        }
    }

    fn unlock(&self) -> bool {
        match self {
            Self::Serialized(heap) => heap.unlock(),
            Self::Unserialized(heap) => heap.unlock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::backing::VirtualMemory;

    fn shared() -> Arc<SyncHeap> {
        let core = HeapCore::create(
            HeapFlags::NONE,
            0,
            0,
            HeapConfig::default(),
            Arc::new(VirtualMemory::new()),
        )
        .unwrap();
        Arc::new(SyncHeap::new(core))
    }

    #[test]
    fn lock_is_reentrant_for_owner() {
        let lock = HeapLock::new();
        lock.acquire();
        lock.acquire();
        assert!(lock.is_held_by_current_thread());
        assert!(lock.release());
        assert!(lock.is_held_by_current_thread());
        assert!(lock.release());
        assert!(!lock.is_held_by_current_thread());
        assert!(!lock.release());
    }

    #[test]
    fn locked_heap_blocks_other_threads() {
        let heap = shared();
        assert!(heap.lock());
        let ptr = heap.allocate(HeapFlags::NONE, 16).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let heap = Arc::clone(&heap);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let p = heap.allocate(HeapFlags::NONE, 16).unwrap();
                done.store(true, Ordering::SeqCst);
                p
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst), "allocation ran while locked");
        assert!(heap.unlock());
        let other = worker.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_ne!(ptr, other);
    }

    #[test]
    fn unlock_from_other_thread_fails() {
        let heap = shared();
        assert!(heap.lock());
        let other = Arc::clone(&heap);
        assert!(!thread::spawn(move || other.unlock()).join().unwrap());
        assert!(heap.unlock());
    }

    #[test]
    fn concurrent_traffic_keeps_heap_consistent() {
        let heap = shared();
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..200usize {
                        let size = 16 + (i * 37 + t * 11) % 900;
                        live.push(heap.allocate(HeapFlags::NONE, size).unwrap());
                        if i % 3 == 0 {
                            let ptr = live.swap_remove(i % live.len());
                            heap.deallocate(HeapFlags::NONE, ptr).unwrap();
                        }
                    }
                    for ptr in live {
                        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(heap.validate(HeapFlags::NONE, None));
        assert_eq!(heap.summary().live_blocks, 0);
    }

    #[test]
    fn no_serialize_heap_is_local() {
        let heap = Heap::create(
            HeapFlags::NO_SERIALIZE,
            0,
            0,
            HeapConfig::default(),
            Arc::new(VirtualMemory::new()),
        )
        .unwrap();
        assert!(matches!(heap, Heap::Unserialized(_)));
        let ptr = heap.allocate(HeapFlags::NONE, 40).unwrap();
        assert!(heap.lock());
        assert_eq!(heap.size_of(HeapFlags::NONE, ptr).unwrap(), 40);
        assert!(heap.unlock());
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
}
