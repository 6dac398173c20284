//! Handle registry.
//!
//! Handle 1 names the process heap. Serialized heaps are shared through a
//! global table; unserialized heaps stay in a thread-local table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rtlheap_core::{HeapCore, HeapError, HeapOps, LocalHeap, SyncHeap, process_heap};

pub(crate) const PROCESS_HEAP_HANDLE: usize = 1;

static NEXT_HANDLE: AtomicUsize = AtomicUsize::new(0x10);

fn shared_table() -> &'static RwLock<HashMap<usize, Arc<SyncHeap>>> {
    static TABLE: OnceLock<RwLock<HashMap<usize, Arc<SyncHeap>>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

thread_local! {
    static LOCAL_TABLE: RefCell<HashMap<usize, Rc<LocalHeap>>> = RefCell::new(HashMap::new());
}

/// A handle resolved to the heap it names.
pub(crate) enum Resolved {
    Process(&'static SyncHeap),
    Shared(Arc<SyncHeap>),
    Local(Rc<LocalHeap>),
}

impl HeapOps for Resolved {
    fn with_core<R>(&self, f: impl FnOnce(&mut HeapCore) -> R) -> R {
        match self {
            Self::Process(heap) => heap.with_core(f),
            Self::Shared(heap) => heap.with_core(f),
            Self::Local(heap) => heap.with_core(f),
        }
    }

    fn lock(&self) -> bool {
        match self {
            Self::Process(heap) => heap.lock(),
            Self::Shared(heap) => heap.lock(),
            Self::Local(heap) => heap.lock(),
        }
    }

    fn unlock(&self) -> bool {
        match self {
            Self::Process(heap) => heap.unlock(),
            Self::Shared(heap) => heap.unlock(),
            Self::Local(heap) => heap.unlock(),
        }
    }
}

/// Registers a new heap and returns its handle.
pub(crate) fn register(core: HeapCore, serialize: bool) -> usize {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    if serialize {
        shared_table()
            .write()
            .insert(handle, Arc::new(SyncHeap::new(core)));
    } else {
        LOCAL_TABLE.with(|table| {
            table
                .borrow_mut()
                .insert(handle, Rc::new(LocalHeap::new(core)))
        });
    }
    handle
}

pub(crate) fn resolve(handle: usize) -> Option<Resolved> {
    if handle == PROCESS_HEAP_HANDLE {
        return process_heap().ok().map(Resolved::Process);
    }
    if let Some(heap) = shared_table().read().get(&handle) {
        return Some(Resolved::Shared(Arc::clone(heap)));
    }
    LOCAL_TABLE.with(|table| table.borrow().get(&handle).cloned().map(Resolved::Local))
}

/// Unregisters `handle` and releases its heap once no call is using it.
pub(crate) fn destroy(handle: usize) -> Result<(), Option<HeapError>> {
    if handle == PROCESS_HEAP_HANDLE {
        return Err(Some(HeapError::ProcessHeap));
    }
    let shared = shared_table().write().remove(&handle);
    if let Some(heap) = shared {
        if let Ok(heap) = Arc::try_unwrap(heap) {
            heap.into_core().destroy();
        }
        return Ok(());
    }
    let local = LOCAL_TABLE.with(|table| table.borrow_mut().remove(&handle));
    match local {
        Some(heap) => {
            if let Ok(heap) = Rc::try_unwrap(heap) {
                heap.into_core().destroy();
            }
            Ok(())
        }
        None => Err(None),
    }
}

/// Every handle visible to the calling thread, in ascending order.
pub(crate) fn handles() -> Vec<usize> {
    let mut all = Vec::new();
    if process_heap().is_ok() {
        all.push(PROCESS_HEAP_HANDLE);
    }
    all.extend(shared_table().read().keys().copied());
    LOCAL_TABLE.with(|table| all.extend(table.borrow().keys().copied()));
    all.sort_unstable();
    all
}
