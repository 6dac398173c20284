//! The heap engine and its on-memory formats.

pub mod arena;
mod engine;
pub mod free_list;
pub mod large;
pub mod pending;
pub mod size_class;
mod small;
pub mod subheap;
mod validate;
mod walk;

pub use self::engine::{HeapCore, HeapInformation, HeapSummary};
pub use self::walk::{EntryKind, HeapEntry, RegionInfo, WalkCursor};
