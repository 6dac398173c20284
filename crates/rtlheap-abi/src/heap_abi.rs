//! Handle-level heap entry points.
//!
//! Every function resolves its handle, runs one [`HeapOps`] call and maps the
//! outcome to the sentinel return of the native API. The last status is set
//! on every failure and cleared on success.

use rtlheap_core::error::{
    STATUS_INVALID_HANDLE, STATUS_INVALID_PARAMETER, STATUS_NO_MORE_ENTRIES, STATUS_SUCCESS,
};
use rtlheap_core::{
    HeapConfig, HeapCore, HeapEntry, HeapError, HeapFlags, HeapInformation, HeapLogRecord,
    HeapOps, HeapSummary, WalkCursor, default_store,
};

use crate::page::commit_granularity;
use crate::registry::{self, PROCESS_HEAP_HANDLE, Resolved};
use crate::status::{report, set_status};

/// Runs `f` against the heap named by `handle`, returning `failed` if the
/// handle is unknown or `f` fails.
fn with_heap<R>(
    handle: usize,
    failed: R,
    f: impl FnOnce(&Resolved) -> Result<R, HeapError>,
) -> R {
    let Some(heap) = registry::resolve(handle) else {
        set_status(STATUS_INVALID_HANDLE);
        return failed;
    };
    match f(&heap) {
        Ok(value) => {
            set_status(STATUS_SUCCESS);
            value
        }
        Err(err) => {
            report(&err);
            failed
        }
    }
}

/// Creates a heap. Returns its handle, or 0.
///
/// `initial_size` is committed up front and `max_size` reserved; a zero in
/// either makes the heap growable.
pub fn heap_create(flags: u32, initial_size: usize, max_size: usize) -> usize {
    let flags = HeapFlags::from_bits_truncate(flags);
    let config = HeapConfig::from_env().with_commit_granularity(commit_granularity());
    match HeapCore::create(flags, initial_size, max_size, config, default_store()) {
        Ok(core) => {
            let serialize = !core.flags().contains(HeapFlags::NO_SERIALIZE);
            set_status(STATUS_SUCCESS);
            registry::register(core, serialize)
        }
        Err(err) => {
            report(&err);
            0
        }
    }
}

/// Destroys a heap and releases all of its memory. Returns 0 on success and
/// the handle itself on failure; the process heap is never destroyed.
pub fn heap_destroy(handle: usize) -> usize {
    match registry::destroy(handle) {
        Ok(()) => {
            set_status(STATUS_SUCCESS);
            0
        }
        Err(Some(err)) => {
            report(&err);
            handle
        }
        Err(None) => {
            set_status(STATUS_INVALID_HANDLE);
            handle
        }
    }
}

/// Allocates `size` bytes. Returns the block address, or 0.
pub fn heap_alloc(handle: usize, flags: u32, size: usize) -> usize {
    with_heap(handle, 0, |heap| {
        heap.allocate(HeapFlags::from_bits_truncate(flags), size)
    })
}

/// Frees `ptr`. Freeing 0 succeeds.
pub fn heap_free(handle: usize, flags: u32, ptr: usize) -> bool {
    with_heap(handle, false, |heap| {
        heap.deallocate(HeapFlags::from_bits_truncate(flags), ptr)
            .map(|()| true)
    })
}

/// Resizes `ptr`. Returns the (possibly moved) block, or 0 with the old
/// block untouched.
pub fn heap_realloc(handle: usize, flags: u32, ptr: usize, size: usize) -> usize {
    with_heap(handle, 0, |heap| {
        heap.resize(HeapFlags::from_bits_truncate(flags), ptr, size)
    })
}

/// Size last requested for `ptr`, or `usize::MAX`.
pub fn heap_size(handle: usize, flags: u32, ptr: usize) -> usize {
    with_heap(handle, usize::MAX, |heap| {
        heap.size_of(HeapFlags::from_bits_truncate(flags), ptr)
    })
}

/// Validates one block, or the whole heap when `ptr` is 0.
pub fn heap_validate(handle: usize, flags: u32, ptr: usize) -> bool {
    with_heap(handle, false, |heap| {
        let ok = heap.validate(
            HeapFlags::from_bits_truncate(flags),
            (ptr != 0).then_some(ptr),
        );
        if ok {
            Ok(true)
        } else {
            Err(HeapError::InvalidParameter("validation failed"))
        }
    })
}

/// Advances a walk. Returns `STATUS_SUCCESS` with `entry` filled in,
/// `STATUS_NO_MORE_ENTRIES` at the end, or the failure status.
pub fn heap_walk(handle: usize, cursor: &mut WalkCursor, entry: &mut HeapEntry) -> u32 {
    let Some(heap) = registry::resolve(handle) else {
        set_status(STATUS_INVALID_HANDLE);
        return STATUS_INVALID_HANDLE;
    };
    let status = match heap.walk(cursor) {
        Ok(Some(next)) => {
            *entry = next;
            STATUS_SUCCESS
        }
        Ok(None) => STATUS_NO_MORE_ENTRIES,
        Err(err) => {
            report(&err);
            return err.status();
        }
    };
    set_status(status);
    status
}

/// Takes the heap lock for the calling thread. Recursive.
pub fn heap_lock(handle: usize) -> bool {
    with_heap(handle, false, |heap| Ok(heap.lock()))
}

pub fn heap_unlock(handle: usize) -> bool {
    with_heap(handle, false, |heap| {
        if heap.unlock() {
            Ok(true)
        } else {
            Err(HeapError::InvalidParameter("heap lock not held"))
        }
    })
}

/// Flushes delayed frees. Returns the bytes reclaimed.
pub fn heap_compact(handle: usize, flags: u32) -> usize {
    with_heap(handle, 0, |heap| {
        Ok(heap.compact(HeapFlags::from_bits_truncate(flags)))
    })
}

/// Handle of the process heap, or 0 if it could not be created.
pub fn get_process_heap() -> usize {
    if registry::resolve(PROCESS_HEAP_HANDLE).is_some() {
        PROCESS_HEAP_HANDLE
    } else {
        set_status(STATUS_INVALID_HANDLE);
        0
    }
}

/// Copies as many visible heap handles as fit into `out` and returns how
/// many exist.
pub fn get_process_heaps(out: &mut [usize]) -> usize {
    let all = registry::handles();
    let n = all.len().min(out.len());
    out[..n].copy_from_slice(&all[..n]);
    all.len()
}

/// Reads an information class. `class` is the raw class number.
pub fn heap_query_information(handle: usize, class: u32, out: &mut u32) -> bool {
    let Some(class) = HeapInformation::from_raw(class) else {
        set_status(STATUS_INVALID_PARAMETER);
        return false;
    };
    with_heap(handle, false, |heap| {
        *out = heap.query_information(class)?;
        Ok(true)
    })
}

pub fn heap_set_information(handle: usize, class: u32, value: u32) -> bool {
    let Some(class) = HeapInformation::from_raw(class) else {
        set_status(STATUS_INVALID_PARAMETER);
        return false;
    };
    with_heap(handle, false, |heap| {
        heap.set_information(class, value).map(|()| true)
    })
}

/// Copies bytes out of a live block.
pub fn heap_read(handle: usize, ptr: usize, offset: usize, buf: &mut [u8]) -> bool {
    with_heap(handle, false, |heap| {
        heap.read(ptr, offset, buf).map(|()| true)
    })
}

/// Copies bytes into a live block.
pub fn heap_write(handle: usize, ptr: usize, offset: usize, data: &[u8]) -> bool {
    with_heap(handle, false, |heap| {
        heap.write(ptr, offset, data).map(|()| true)
    })
}

pub fn heap_summary(handle: usize) -> Option<HeapSummary> {
    with_heap(handle, None, |heap| Ok(Some(heap.summary())))
}

/// Takes the buffered lifecycle records of a heap.
pub fn heap_drain_logs(handle: usize) -> Vec<HeapLogRecord> {
    with_heap(handle, Vec::new(), |heap| Ok(heap.drain_logs()))
}
