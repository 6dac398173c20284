//! Walk reports: a serializable snapshot of every heap entry plus a digest.

use serde::Serialize;
use sha2::{Digest, Sha256};

use rtlheap_core::{EntryKind, HeapEntry, HeapOps, HeapSummary, WalkCursor};

use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkEntry {
    pub kind: &'static str,
    pub addr: u64,
    pub size: u64,
    pub overhead: u64,
    pub region_index: u64,
}

impl From<&HeapEntry> for WalkEntry {
    fn from(entry: &HeapEntry) -> Self {
        Self {
            kind: kind_name(entry.kind),
            addr: entry.addr as u64,
            size: entry.size as u64,
            overhead: entry.overhead as u64,
            region_index: entry.region_index as u64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub region: usize,
    pub busy: usize,
    pub free: usize,
    pub pending: usize,
    pub uncommitted: usize,
    pub large: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkReport {
    pub heap_id: u64,
    pub counts: KindCounts,
    pub busy_bytes: u64,
    pub free_bytes: u64,
    pub committed: u64,
    pub reserved: u64,
    /// Lowercase hex SHA-256 over the entry list.
    pub digest: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<WalkEntry>,
}

#[must_use]
pub fn kind_name(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Region => "region",
        EntryKind::Busy => "busy",
        EntryKind::Free => "free",
        EntryKind::Pending => "pending",
        EntryKind::Uncommitted => "uncommitted",
        EntryKind::Large => "large",
    }
}

impl WalkReport {
    /// Walks `heap` to the end. With `keep_entries` unset only the counts and
    /// digest are retained.
    pub fn collect(heap: &impl HeapOps, keep_entries: bool) -> Result<Self, HarnessError> {
        let mut cursor = WalkCursor::new();
        let mut hasher = Sha256::new();
        let mut counts = KindCounts::default();
        let mut entries = Vec::new();
        let (mut busy_bytes, mut free_bytes) = (0u64, 0u64);

        while let Some(entry) = heap.walk(&mut cursor)? {
            let row = WalkEntry::from(&entry);
            hasher.update(row.kind.as_bytes());
            hasher.update(row.addr.to_le_bytes());
            hasher.update(row.size.to_le_bytes());
            match entry.kind {
                EntryKind::Region => counts.region += 1,
                EntryKind::Busy => {
                    counts.busy += 1;
                    busy_bytes += row.size;
                }
                EntryKind::Large => {
                    counts.large += 1;
                    busy_bytes += row.size;
                }
                EntryKind::Free => {
                    counts.free += 1;
                    free_bytes += row.size;
                }
                EntryKind::Pending => counts.pending += 1,
                EntryKind::Uncommitted => counts.uncommitted += 1,
            }
            if keep_entries {
                entries.push(row);
            }
        }

        let summary: HeapSummary = heap.summary();
        Ok(Self {
            heap_id: heap.id(),
            counts,
            busy_bytes,
            free_bytes,
            committed: summary.committed as u64,
            reserved: summary.reserved as u64,
            digest: hex_lower(&hasher.finalize()),
            entries,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex_lower(&[0x0a, 0xff, 0x00]), "0aff00");
    }

    #[test]
    fn kind_names_are_distinct() {
        let kinds = [
            EntryKind::Region,
            EntryKind::Busy,
            EntryKind::Free,
            EntryKind::Pending,
            EntryKind::Uncommitted,
            EntryKind::Large,
        ];
        let mut names: Vec<_> = kinds.iter().map(|k| kind_name(*k)).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), kinds.len());
    }
}
