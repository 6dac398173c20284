//! Per-thread last status and fatal escalation.

use std::cell::Cell;

use parking_lot::{RwLock, const_rwlock};
use rtlheap_core::HeapError;
use rtlheap_core::error::STATUS_SUCCESS;

/// Receives failures escalated to fatal (exhaustion with
/// `GENERATE_EXCEPTIONS`, corruption under the terminate policy).
pub type FatalHook = fn(&HeapError);

thread_local! {
    static LAST_STATUS: Cell<u32> = const { Cell::new(STATUS_SUCCESS) };
}

static FATAL_HOOK: RwLock<Option<FatalHook>> = const_rwlock(None);

/// Status of the last heap call made by this thread.
pub fn last_status() -> u32 {
    LAST_STATUS.with(Cell::get)
}

pub(crate) fn set_status(status: u32) {
    LAST_STATUS.with(|cell| cell.set(status));
}

/// Installs the fatal handler; `None` restores the default, which panics.
pub fn set_fatal_hook(hook: Option<FatalHook>) {
    *FATAL_HOOK.write() = hook;
}

/// Records a failed call and escalates it if required.
pub(crate) fn report(err: &HeapError) {
    set_status(err.status());
    if err.is_fatal() {
        let hook = *FATAL_HOOK.read();
        match hook {
            Some(hook) => hook(err),
            None => panic!("{err}"),
        }
    }
}
