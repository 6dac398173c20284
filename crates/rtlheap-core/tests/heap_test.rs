//! Integration test: heap engine
//!
//! Exercises allocation, free, resize, growth, the large-block path and the
//! checking modes through the public `HeapCore` API.
//!
//! Run: cargo test -p rtlheap-core --test heap_test

use std::sync::Arc;

use rtlheap_core::config::DEFAULT_LARGE_THRESHOLD;
use rtlheap_core::{
    BackingStore, CorruptionKind, EntryKind, HeapConfig, HeapCore, HeapError, HeapFlags, HeapInformation,
    HeapLogLevel, ValidateMode, VirtualMemory, WalkCursor,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct XorShift64(u64);

impl XorShift64 {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn growable(flags: HeapFlags) -> HeapCore {
    growable_with(flags, HeapConfig::default())
}

fn growable_with(flags: HeapFlags, config: HeapConfig) -> HeapCore {
    HeapCore::create(flags, 0, 0, config, Arc::new(VirtualMemory::new())).unwrap()
}

fn fixed(size: usize) -> HeapCore {
    HeapCore::create(
        HeapFlags::NONE,
        size,
        size,
        HeapConfig::default(),
        Arc::new(VirtualMemory::new()),
    )
    .unwrap()
}

fn corruption_kind(err: &HeapError) -> Option<CorruptionKind> {
    match err.root() {
        HeapError::Corruption { kind, .. } => Some(*kind),
        _ => None,
    }
}

fn walk_kinds(heap: &HeapCore) -> Vec<(EntryKind, usize, usize)> {
    let mut cursor = WalkCursor::new();
    let mut out = Vec::new();
    while let Some(entry) = heap.walk(&mut cursor).unwrap() {
        out.push((entry.kind, entry.addr, entry.size));
    }
    out
}

// ---------------------------------------------------------------------------
// 1. Sizes and alignment
// ---------------------------------------------------------------------------

#[test]
fn size_of_reports_requested_size() {
    for flags in [HeapFlags::NONE, HeapFlags::TAIL_CHECKING_ENABLED] {
        let mut heap = growable(flags);
        for size in [0usize, 1, 15, 16, 17, 40, 41, 255, 256, 1000, 4095, 70_000] {
            let ptr = heap.allocate(HeapFlags::NONE, size).unwrap();
            assert_eq!(ptr % 16, 0, "size={size} flags={flags:?}");
            assert_eq!(heap.size_of(HeapFlags::NONE, ptr).unwrap(), size);
        }
        assert!(heap.validate(HeapFlags::NONE, None));
    }
}

#[test]
fn null_pointer_handling() {
    let mut heap = growable(HeapFlags::NONE);
    assert!(heap.deallocate(HeapFlags::NONE, 0).is_ok());
    assert!(matches!(
        heap.size_of(HeapFlags::NONE, 0),
        Err(HeapError::InvalidParameter(_))
    ));
    assert!(matches!(
        heap.resize(HeapFlags::NONE, 0, 32),
        Err(HeapError::InvalidParameter(_))
    ));
}

#[test]
fn foreign_pointer_is_rejected() {
    let mut heap = growable(HeapFlags::NONE);
    let ptr = heap.allocate(HeapFlags::NONE, 32).unwrap();
    assert!(matches!(
        heap.deallocate(HeapFlags::NONE, ptr + 8),
        Err(HeapError::InvalidPointer { .. })
    ));
    assert!(matches!(
        heap.deallocate(HeapFlags::NONE, 0x10),
        Err(HeapError::InvalidPointer { .. })
    ));
    assert_eq!(heap.size_of(HeapFlags::NONE, ptr).unwrap(), 32);
}

// ---------------------------------------------------------------------------
// 2. Randomized traffic
// ---------------------------------------------------------------------------

#[test]
fn live_blocks_never_overlap() {
    let seed = 0x5eed_1234_u64;
    let mut rng = XorShift64(seed);
    let mut heap = growable(HeapFlags::NONE);
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    for step in 0..2_000 {
        if live.is_empty() || rng.below(3) != 0 {
            let size = rng.below(2048) as usize + 1;
            let ptr = heap.allocate(HeapFlags::NONE, size).unwrap();
            let tag = (step % 251) as u8;
            heap.fill(ptr, 0, tag, size).unwrap();
            for &(other, other_size, _) in &live {
                assert!(
                    ptr + size <= other || other + other_size <= ptr,
                    "seed={seed:#x} step={step}: {ptr:#x}+{size} overlaps {other:#x}+{other_size}"
                );
            }
            live.push((ptr, size, tag));
        } else {
            let idx = rng.below(live.len() as u64) as usize;
            let (ptr, size, tag) = live.swap_remove(idx);
            let mut buf = vec![0u8; size];
            heap.read(ptr, 0, &mut buf).unwrap();
            assert!(
                buf.iter().all(|&b| b == tag),
                "seed={seed:#x} step={step}: block {ptr:#x} lost its contents"
            );
            heap.deallocate(HeapFlags::NONE, ptr).unwrap();
        }
    }
    assert!(heap.validate(HeapFlags::NONE, None), "seed={seed:#x}");
    let summary = heap.summary();
    assert_eq!(summary.live_blocks, live.len());
    assert_eq!(
        summary.allocated,
        live.iter().map(|&(_, size, _)| size).sum::<usize>()
    );
}

// ---------------------------------------------------------------------------
// 3. Coalescing and exhaustion
// ---------------------------------------------------------------------------

#[test]
fn freeing_everything_coalesces_fixed_heap() {
    let mut heap = fixed(0x1_0000);
    let before = heap.summary();
    assert_eq!(before.free_blocks, 1);

    let mut ptrs = Vec::new();
    loop {
        match heap.allocate(HeapFlags::NONE, 64) {
            Ok(ptr) => ptrs.push(ptr),
            Err(err) => {
                assert!(matches!(err, HeapError::Exhausted { .. }), "{err:?}");
                break;
            }
        }
    }
    assert!(ptrs.len() > 700);

    let mut rng = XorShift64(0xc0a1_e5ce);
    while !ptrs.is_empty() {
        let idx = rng.below(ptrs.len() as u64) as usize;
        heap.deallocate(HeapFlags::NONE, ptrs.swap_remove(idx)).unwrap();
    }
    let after = heap.summary();
    assert_eq!(after.free_blocks, 1);
    assert_eq!(after.free_bytes, before.free_bytes);
    assert_eq!(after.subheaps, 1);

    let big = heap.allocate(HeapFlags::NONE, 60_000).unwrap();
    assert_eq!(heap.size_of(HeapFlags::NONE, big).unwrap(), 60_000);
}

#[test]
fn fixed_heap_does_not_grow() {
    let mut heap = fixed(0x1_0000);
    let err = heap.allocate(HeapFlags::NONE, 0x2_0000).unwrap_err();
    assert!(matches!(err, HeapError::Exhausted { requested: 0x2_0000 }));
    assert_eq!(heap.summary().subheaps, 1);
    assert_eq!(heap.summary().large_blocks, 0);

    let err = heap
        .allocate(HeapFlags::GENERATE_EXCEPTIONS, 0x2_0000)
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err.root(), HeapError::Exhausted { .. }));
}

#[test]
fn fixed_heap_refuses_twice_its_size() {
    for n in [1usize, 256, 4096, 0x8000, 0x1_0000] {
        let mut heap = fixed(n);
        let err = heap.allocate(HeapFlags::NONE, 2 * n).unwrap_err();
        assert_eq!(err, HeapError::Exhausted { requested: 2 * n }, "n={n:#x}");

        let err = heap
            .allocate(HeapFlags::GENERATE_EXCEPTIONS, 2 * n)
            .unwrap_err();
        assert!(err.is_fatal(), "n={n:#x}");
        assert_eq!(err.root(), &HeapError::Exhausted { requested: 2 * n });
        assert!(heap.validate(HeapFlags::NONE, None));
    }
}

#[test]
fn fixed_heap_space_stops_at_its_size() {
    let mut heap = fixed(4096);
    assert_eq!(heap.summary().reserved, 0x1_0000);

    let mut ptrs = Vec::new();
    while let Ok(ptr) = heap.allocate(HeapFlags::NONE, 64) {
        ptrs.push(ptr);
    }
    assert!(!ptrs.is_empty());
    assert!(ptrs.len() * 64 <= 4096, "{} blocks", ptrs.len());
    assert!(heap.validate(HeapFlags::NONE, None));

    let last = *ptrs.last().unwrap();
    assert!(heap.resize(HeapFlags::NONE, last, 8192).is_err());
    for ptr in ptrs {
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
    assert_eq!(heap.summary().free_blocks, 1);
}

#[test]
fn overflowing_size_is_rejected() {
    let mut heap = growable(HeapFlags::NONE);
    assert!(matches!(
        heap.allocate(HeapFlags::NONE, usize::MAX - 4),
        Err(HeapError::Overflow { .. })
    ));
}

#[test]
fn growable_heap_adds_subheaps() {
    let config = HeapConfig::default()
        .with_default_subheap_size(0x1_0000)
        .with_log(512, HeapLogLevel::Info);
    let mut heap = growable_with(HeapFlags::NONE, config);
    let ptrs: Vec<usize> = (0..64)
        .map(|_| heap.allocate(HeapFlags::NONE, 4000).unwrap())
        .collect();
    assert!(heap.summary().subheaps > 1);
    assert!(heap.validate(HeapFlags::NONE, None));
    let logs = heap.drain_logs();
    assert!(logs.iter().any(|r| r.event == "subheap_grow"));

    for ptr in ptrs {
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
    assert_eq!(heap.summary().live_blocks, 0);
    assert!(heap.validate(HeapFlags::NONE, None));
}

// ---------------------------------------------------------------------------
// 4. Zero fill
// ---------------------------------------------------------------------------

#[test]
fn zero_memory_clears_reused_blocks() {
    let mut heap = growable(HeapFlags::NONE);
    let ptr = heap.allocate(HeapFlags::NONE, 200).unwrap();
    heap.fill(ptr, 0, 0xcc, 200).unwrap();
    heap.deallocate(HeapFlags::NONE, ptr).unwrap();

    let again = heap.allocate(HeapFlags::ZERO_MEMORY, 200).unwrap();
    let mut buf = [0xffu8; 200];
    heap.read(again, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn zero_memory_resize_clears_new_tail() {
    let mut heap = growable(HeapFlags::NONE);
    let ptr = heap.allocate(HeapFlags::NONE, 64).unwrap();
    heap.fill(ptr, 0, 0x77, 64).unwrap();
    let grown = heap.resize(HeapFlags::ZERO_MEMORY, ptr, 512).unwrap();
    let mut buf = [0xffu8; 512];
    heap.read(grown, 0, &mut buf).unwrap();
    assert!(buf[..64].iter().all(|&b| b == 0x77));
    assert!(buf[64..].iter().all(|&b| b == 0));
}

// ---------------------------------------------------------------------------
// 5. Resize
// ---------------------------------------------------------------------------

#[test]
fn shrink_keeps_pointer_and_prefix() {
    let mut heap = growable(HeapFlags::NONE);
    let ptr = heap.allocate(HeapFlags::NONE, 300).unwrap();
    let _fence = heap.allocate(HeapFlags::NONE, 16).unwrap();
    let data: Vec<u8> = (0..300).map(|i| i as u8).collect();
    heap.write(ptr, 0, &data).unwrap();

    let shrunk = heap.resize(HeapFlags::NONE, ptr, 40).unwrap();
    assert_eq!(shrunk, ptr);
    assert_eq!(heap.size_of(HeapFlags::NONE, ptr).unwrap(), 40);
    let mut buf = [0u8; 40];
    heap.read(ptr, 0, &mut buf).unwrap();
    assert_eq!(&buf[..], &data[..40]);
    assert!(heap.validate(HeapFlags::NONE, None));
}

#[test]
fn grow_in_place_uses_free_successor() {
    let mut heap = growable(HeapFlags::NONE);
    let ptr = heap.allocate(HeapFlags::NONE, 64).unwrap();
    let grown = heap
        .resize(HeapFlags::REALLOC_IN_PLACE_ONLY, ptr, 4096)
        .unwrap();
    assert_eq!(grown, ptr);
    assert_eq!(heap.size_of(HeapFlags::NONE, ptr).unwrap(), 4096);
    assert!(heap.validate(HeapFlags::NONE, None));
}

#[test]
fn blocked_resize_moves_unless_in_place_only() {
    let mut heap = growable(HeapFlags::NONE);
    let a = heap.allocate(HeapFlags::NONE, 64).unwrap();
    let _b = heap.allocate(HeapFlags::NONE, 64).unwrap();
    heap.fill(a, 0, 0x3c, 64).unwrap();

    let err = heap
        .resize(HeapFlags::REALLOC_IN_PLACE_ONLY, a, 1000)
        .unwrap_err();
    assert!(matches!(err, HeapError::NotInPlace { .. }));
    assert_eq!(heap.size_of(HeapFlags::NONE, a).unwrap(), 64);

    let moved = heap.resize(HeapFlags::NONE, a, 1000).unwrap();
    assert_ne!(moved, a);
    let mut buf = [0u8; 64];
    heap.read(moved, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x3c));
    assert!(heap.size_of(HeapFlags::NONE, a).is_err());
    assert!(heap.validate(HeapFlags::NONE, None));
}

#[test]
fn large_blocks_resize_in_place_within_capacity() {
    let mut heap = growable(HeapFlags::NONE);
    let ptr = heap.allocate(HeapFlags::NONE, DEFAULT_LARGE_THRESHOLD).unwrap();
    heap.fill(ptr, 0, 0x42, 128).unwrap();
    let same = heap.resize(HeapFlags::NONE, ptr, 0x1000).unwrap();
    assert_eq!(same, ptr);
    assert_eq!(heap.size_of(HeapFlags::NONE, ptr).unwrap(), 0x1000);

    let moved = heap.resize(HeapFlags::NONE, ptr, 0x20_0000).unwrap();
    assert_ne!(moved, ptr);
    let mut buf = [0u8; 128];
    heap.read(moved, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x42));
    assert_eq!(heap.summary().large_blocks, 1);
}

// ---------------------------------------------------------------------------
// 6. Large/small boundary
// ---------------------------------------------------------------------------

#[test]
fn large_threshold_selects_path() {
    let mut heap = growable(HeapFlags::NONE);
    let small = heap
        .allocate(HeapFlags::NONE, DEFAULT_LARGE_THRESHOLD - 1)
        .unwrap();
    let large = heap.allocate(HeapFlags::NONE, DEFAULT_LARGE_THRESHOLD).unwrap();
    let entries = walk_kinds(&heap);
    assert!(entries.contains(&(EntryKind::Busy, small, DEFAULT_LARGE_THRESHOLD - 1)));
    assert!(entries.contains(&(EntryKind::Large, large, DEFAULT_LARGE_THRESHOLD)));
    let with_large = heap.summary();
    assert_eq!(with_large.large_blocks, 1);

    heap.deallocate(HeapFlags::NONE, large).unwrap();
    let without = heap.summary();
    assert_eq!(without.large_blocks, 0);
    assert!(with_large.committed - without.committed > DEFAULT_LARGE_THRESHOLD);
    assert!(!walk_kinds(&heap).iter().any(|e| e.0 == EntryKind::Large));
}

#[test]
fn fixed_heap_never_uses_large_path() {
    let mut heap = fixed(0x20_0000);
    let ptr = heap.allocate(HeapFlags::NONE, DEFAULT_LARGE_THRESHOLD).unwrap();
    assert_eq!(heap.summary().large_blocks, 0);
    assert!(
        walk_kinds(&heap).contains(&(EntryKind::Busy, ptr, DEFAULT_LARGE_THRESHOLD))
    );
}

// ---------------------------------------------------------------------------
// 7. Double free and free checking
// ---------------------------------------------------------------------------

#[test]
fn double_free_is_reported() {
    let mut heap = growable(HeapFlags::NONE);
    let a = heap.allocate(HeapFlags::NONE, 48).unwrap();
    let _b = heap.allocate(HeapFlags::NONE, 48).unwrap();
    heap.deallocate(HeapFlags::NONE, a).unwrap();
    let err = heap.deallocate(HeapFlags::NONE, a).unwrap_err();
    assert_eq!(corruption_kind(&err), Some(CorruptionKind::DoubleFree));
    assert!(!err.is_fatal());
    assert!(heap.validate(HeapFlags::NONE, None));
}

#[test]
fn termination_policy_escalates_corruption() {
    let mut heap = growable(HeapFlags::NONE);
    heap.set_information(HeapInformation::EnableTerminationOnCorruption, 0)
        .unwrap();
    let a = heap.allocate(HeapFlags::NONE, 48).unwrap();
    let _b = heap.allocate(HeapFlags::NONE, 48).unwrap();
    heap.deallocate(HeapFlags::NONE, a).unwrap();
    let err = heap.deallocate(HeapFlags::NONE, a).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(corruption_kind(&err), Some(CorruptionKind::DoubleFree));
}

#[test]
fn free_checking_parks_blocks_until_compact() {
    let mut heap = growable(HeapFlags::FREE_CHECKING_ENABLED);
    let ptrs: Vec<usize> = (0..8)
        .map(|_| heap.allocate(HeapFlags::NONE, 96).unwrap())
        .collect();
    let mut buf = [0u8; 96];
    heap.read(ptrs[0], 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x55), "fresh blocks carry the in-use filler");

    for &ptr in &ptrs {
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
    assert_eq!(heap.summary().pending_blocks, 8);
    let err = heap.deallocate(HeapFlags::NONE, ptrs[3]).unwrap_err();
    assert_eq!(corruption_kind(&err), Some(CorruptionKind::DoubleFree));
    assert!(heap.validate(HeapFlags::NONE, None));

    let reclaimed = heap.compact(HeapFlags::NONE);
    assert_eq!(reclaimed, 8 * (96 + 8 + 8));
    let summary = heap.summary();
    assert_eq!(summary.pending_blocks, 0);
    assert_eq!(summary.free_blocks, 1);
    assert!(heap.validate(HeapFlags::NONE, None));
}

#[test]
fn pending_ring_overflow_releases_oldest() {
    let config = HeapConfig::default().with_pending_free_slots(2);
    let mut heap = growable_with(HeapFlags::FREE_CHECKING_ENABLED, config);
    let ptrs: Vec<usize> = (0..5)
        .map(|_| heap.allocate(HeapFlags::NONE, 32).unwrap())
        .collect();
    for &ptr in &ptrs {
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
    assert_eq!(heap.summary().pending_blocks, 2);
    assert!(heap.validate(HeapFlags::NONE, None));
}

// ---------------------------------------------------------------------------
// 8. Information classes and pre-validation
// ---------------------------------------------------------------------------

#[test]
fn information_classes() {
    let mut heap = growable(HeapFlags::NONE);
    assert_eq!(
        heap.query_information(HeapInformation::Compatibility).unwrap(),
        0
    );
    assert!(heap.set_information(HeapInformation::Compatibility, 0).is_ok());
    assert!(heap.set_information(HeapInformation::Compatibility, 2).is_err());
    assert_eq!(HeapInformation::from_raw(1), Some(HeapInformation::EnableTerminationOnCorruption));
    assert_eq!(HeapInformation::from_raw(7), None);
}

#[test]
fn validate_all_mode_checks_before_each_call() {
    let config = HeapConfig::default().with_validate_mode(ValidateMode::All);
    let mut heap = growable_with(HeapFlags::TAIL_CHECKING_ENABLED, config);
    let mut ptrs = Vec::new();
    for size in (8..400).step_by(24) {
        ptrs.push(heap.allocate(HeapFlags::NONE, size).unwrap());
    }
    for ptr in ptrs.iter().copied().step_by(2) {
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
    let p = heap.resize(HeapFlags::NONE, ptrs[1], 2000).unwrap();
    assert_eq!(heap.size_of(HeapFlags::NONE, p).unwrap(), 2000);
}

#[test]
fn out_of_range_access_is_rejected() {
    let mut heap = growable(HeapFlags::NONE);
    let ptr = heap.allocate(HeapFlags::NONE, 10).unwrap();
    assert!(heap.write(ptr, 8, &[1, 2]).is_ok());
    assert!(matches!(
        heap.write(ptr, 9, &[1, 2]),
        Err(HeapError::InvalidParameter(_))
    ));
    let mut buf = [0u8; 11];
    assert!(heap.read(ptr, 0, &mut buf).is_err());
}

#[test]
fn destroy_returns_every_region() {
    let store = Arc::new(VirtualMemory::new());
    let config = HeapConfig::default().with_log(64, HeapLogLevel::Info);
    let mut heap = HeapCore::create(HeapFlags::NONE, 0, 0, config, store.clone()).unwrap();
    heap.allocate(HeapFlags::NONE, 100).unwrap();
    heap.allocate(HeapFlags::NONE, DEFAULT_LARGE_THRESHOLD * 2).unwrap();
    assert_eq!(store.stats().regions, 2);
    let logs = heap.destroy();
    assert!(logs.iter().any(|r| r.event == "destroy"));
    assert_eq!(store.stats().regions, 0);
    assert_eq!(store.stats().committed_bytes, 0);
}
