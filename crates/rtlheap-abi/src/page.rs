//! Host page size, used to keep commit granularity at least one host page.

use std::sync::OnceLock;

use rtlheap_core::backing::PAGE_SIZE;
use rtlheap_core::config::DEFAULT_COMMIT_GRANULARITY;

/// Page size reported by the host, or 4 KiB if it cannot be queried.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf only reads a configuration value.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(raw)
            .ok()
            .filter(|size| size.is_power_of_two())
            .unwrap_or(PAGE_SIZE)
    })
}

/// Commit granularity for heaps created through handles.
pub fn commit_granularity() -> usize {
    DEFAULT_COMMIT_GRANULARITY.max(page_size())
}
