//! # rtlheap-core
//!
//! Safe Rust implementation of an NT-style process heap: growable subheaps
//! carved into 16-byte aligned arenas, size-classed free lists with eager
//! coalescing, a dedicated-region path for large blocks, optional tail and
//! free checking, whole-heap validation and enumeration.
//!
//! Heap memory is a simulated virtual address space ([`backing`]); addresses
//! handed to callers are plain `usize` values and block contents are reached
//! through [`heap::HeapCore::read`] and [`heap::HeapCore::write`]. No
//! `unsafe` code is permitted in this crate.

#![deny(unsafe_code)]

pub mod backing;
pub mod config;
pub mod error;
pub mod flags;
pub mod heap;
pub mod log;
pub mod process;
pub mod sync;

pub use backing::{BackingStats, BackingStore, Region, VirtualMemory};
pub use config::{CorruptionPolicy, HeapConfig, ValidateMode};
pub use error::{CorruptionKind, HeapError};
pub use flags::HeapFlags;
pub use heap::{EntryKind, HeapCore, HeapEntry, HeapInformation, HeapSummary, RegionInfo, WalkCursor};
pub use log::{HeapLogLevel, HeapLogRecord};
pub use process::{default_store, is_process_heap, process_heap};
pub use sync::{Heap, HeapLock, HeapOps, LocalHeap, SyncHeap};
