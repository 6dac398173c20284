//! Integration test: corruption detection
//!
//! Damages heap memory through the fault-injection hook and checks that the
//! engine reports it without touching the damaged metadata.
//!
//! Run: cargo test -p rtlheap-core --features fault-injection --test corruption_test

use std::sync::Arc;

use rtlheap_core::{
    CorruptionKind, HeapConfig, HeapError, HeapFlags, HeapLogLevel, HeapOps, SyncHeap,
    VirtualMemory, HeapCore,
};

fn shared(flags: HeapFlags, config: HeapConfig) -> SyncHeap {
    SyncHeap::new(
        HeapCore::create(flags, 0, 0, config, Arc::new(VirtualMemory::new())).unwrap(),
    )
}

fn kind_of(err: &HeapError) -> Option<CorruptionKind> {
    match err.root() {
        HeapError::Corruption { kind, .. } => Some(*kind),
        _ => None,
    }
}

#[test]
fn tail_overrun_fails_free_and_leaves_block_live() {
    let heap = shared(HeapFlags::TAIL_CHECKING_ENABLED, HeapConfig::default());
    let ptr = heap.allocate(HeapFlags::NONE, 24).unwrap();
    heap.poke(ptr + 24, &[0x00]).unwrap();

    let err = heap.deallocate(HeapFlags::NONE, ptr).unwrap_err();
    assert_eq!(kind_of(&err), Some(CorruptionKind::TailGuard));
    assert_eq!(heap.summary().live_blocks, 1);
    assert_eq!(heap.size_of(HeapFlags::NONE, ptr).unwrap(), 24);
}

#[test]
fn large_tail_overrun_is_detected() {
    let heap = shared(HeapFlags::TAIL_CHECKING_ENABLED, HeapConfig::default());
    let size = 0x10_0000;
    let ptr = heap.allocate(HeapFlags::NONE, size).unwrap();
    heap.poke(ptr + size + 3, &[0x00]).unwrap();
    let err = heap.deallocate(HeapFlags::NONE, ptr).unwrap_err();
    assert_eq!(kind_of(&err), Some(CorruptionKind::TailGuard));
    assert!(!heap.validate(HeapFlags::NONE, Some(ptr)));
}

#[test]
fn write_after_free_leaks_block_at_flush() {
    let config = HeapConfig::default().with_log(64, HeapLogLevel::Error);
    let heap = shared(HeapFlags::FREE_CHECKING_ENABLED, config);
    let a = heap.allocate(HeapFlags::NONE, 64).unwrap();
    let _b = heap.allocate(HeapFlags::NONE, 64).unwrap();
    heap.deallocate(HeapFlags::NONE, a).unwrap();
    heap.poke(a + 10, &[0x99]).unwrap();

    assert!(!heap.validate(HeapFlags::NONE, None));
    assert_eq!(heap.compact(HeapFlags::NONE), 0);

    let logs = heap.drain_logs();
    let leak = logs
        .iter()
        .find(|r| r.event == "corruption_detected")
        .expect("flush should report the damaged block");
    assert_eq!(leak.outcome, "leaked");
    assert_eq!(leak.addr, Some(a));
}

#[test]
fn smashed_free_header_stops_allocation() {
    let heap = shared(HeapFlags::NONE, HeapConfig::default());
    let a = heap.allocate(HeapFlags::NONE, 64).unwrap();
    let b = heap.allocate(HeapFlags::NONE, 64).unwrap();
    heap.deallocate(HeapFlags::NONE, a).unwrap();
    // Free magic of the hole left by `a`.
    heap.poke(a - 4, &[0xde, 0xad, 0xbe, 0xef]).unwrap();

    let err = heap.allocate(HeapFlags::NONE, 64).unwrap_err();
    assert!(kind_of(&err).is_some(), "{err:?}");
    let err = heap.deallocate(HeapFlags::NONE, b).unwrap_err();
    assert!(kind_of(&err).is_some(), "{err:?}");
}

#[test]
fn terminate_policy_from_config_is_fatal() {
    let config = HeapConfig::default()
        .with_corruption_policy(rtlheap_core::CorruptionPolicy::Terminate);
    let heap = shared(HeapFlags::TAIL_CHECKING_ENABLED, config);
    let ptr = heap.allocate(HeapFlags::NONE, 8).unwrap();
    heap.poke(ptr + 8, &[0x01]).unwrap();
    let err = heap.resize(HeapFlags::NONE, ptr, 16).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(kind_of(&err), Some(CorruptionKind::TailGuard));
}
