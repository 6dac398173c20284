#![no_main]
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use rtlheap_core::{HeapConfig, HeapCore, HeapFlags, VirtualMemory, WalkCursor};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let flags = match data[0] % 4 {
        0 => HeapFlags::GROWABLE,
        1 => HeapFlags::GROWABLE | HeapFlags::TAIL_CHECKING_ENABLED,
        2 => HeapFlags::GROWABLE | HeapFlags::FREE_CHECKING_ENABLED,
        _ => HeapFlags::NONE,
    };
    let size = if flags.contains(HeapFlags::GROWABLE) { 0 } else { 0x20000 };
    let config = HeapConfig::default()
        .with_large_threshold(0x8000)
        .with_pending_free_slots(8);
    let Ok(mut heap) =
        HeapCore::create(flags, size, size, config, Arc::new(VirtualMemory::new()))
    else {
        return;
    };
    let mut live: Vec<(usize, usize)> = Vec::new();

    for chunk in data[1..].chunks_exact(4) {
        let op = chunk[0] % 5;
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let pick = usize::from(chunk[3]);

        match op {
            0 => {
                if let Ok(ptr) = heap.allocate(HeapFlags::NONE, size) {
                    assert_eq!(ptr % 16, 0);
                    assert_eq!(heap.size_of(HeapFlags::NONE, ptr), Ok(size));
                    live.push((ptr, size));
                }
            }
            1 => {
                if !live.is_empty() {
                    let (ptr, _) = live.swap_remove(pick % live.len());
                    heap.deallocate(HeapFlags::NONE, ptr).unwrap();
                }
            }
            2 => {
                if !live.is_empty() {
                    let idx = pick % live.len();
                    if let Ok(ptr) = heap.resize(HeapFlags::NONE, live[idx].0, size) {
                        live[idx] = (ptr, size);
                    }
                }
            }
            3 => {
                assert!(heap.validate(HeapFlags::NONE, None));
            }
            _ => {
                let mut cursor = WalkCursor::new();
                let mut steps = 0usize;
                while heap.walk(&mut cursor).unwrap().is_some() {
                    steps += 1;
                    assert!(steps < 1 << 20);
                }
                heap.compact(HeapFlags::NONE);
            }
        }
    }

    assert!(heap.validate(HeapFlags::NONE, None));
    for (ptr, _) in live {
        heap.deallocate(HeapFlags::NONE, ptr).unwrap();
    }
    assert_eq!(heap.summary().live_blocks, 0);
});
