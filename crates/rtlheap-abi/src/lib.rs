//! # rtlheap-abi
//!
//! Handle-level boundary over `rtlheap-core`.
//!
//! Callers see heaps as integer handles, flags as raw `u32` words and
//! failures as sentinel returns (`0`, `false`, `usize::MAX`) plus a
//! per-thread last-status code, the way the native heap API reports them.
//!
//! ```text
//! caller -> heap_* entry (this crate) -> handle registry -> HeapOps -> HeapCore
//! ```
//!
//! Serialized heaps live in a process-wide registry and may be used from any
//! thread. Heaps created with `NO_SERIALIZE` live in the creating thread's
//! table and are invisible elsewhere.

pub mod heap_abi;
pub mod page;
mod registry;
pub mod status;

pub use heap_abi::*;
pub use status::{last_status, set_fatal_hook};
