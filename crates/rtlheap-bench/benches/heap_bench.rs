//! Heap benchmarks.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rtlheap_core::{HeapConfig, HeapCore, HeapFlags, HeapOps, SyncHeap, VirtualMemory};

fn core(flags: HeapFlags) -> HeapCore {
    HeapCore::create(
        flags | HeapFlags::GROWABLE,
        0,
        0,
        HeapConfig::default(),
        Arc::new(VirtualMemory::new()),
    )
    .unwrap()
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, 0x80000];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        let mut heap = core(HeapFlags::NONE);
        group.bench_with_input(BenchmarkId::new("core", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = heap.allocate(HeapFlags::NONE, sz).unwrap();
                heap.deallocate(HeapFlags::NONE, criterion::black_box(ptr))
                    .unwrap();
            });
        });

        let heap = SyncHeap::new(core(HeapFlags::NONE));
        group.bench_with_input(BenchmarkId::new("sync", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = heap.allocate(HeapFlags::NONE, sz).unwrap();
                heap.deallocate(HeapFlags::NONE, criterion::black_box(ptr))
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    for (name, flags) in [
        ("plain", HeapFlags::NONE),
        ("tail_checking", HeapFlags::TAIL_CHECKING_ENABLED),
        ("free_checking", HeapFlags::FREE_CHECKING_ENABLED),
    ] {
        group.bench_function(BenchmarkId::new("1000x64B", name), |b| {
            b.iter(|| {
                let mut heap = core(flags);
                let ptrs: Vec<usize> = (0..1000)
                    .map(|_| heap.allocate(HeapFlags::NONE, 64).unwrap())
                    .collect();
                for ptr in ptrs {
                    heap.deallocate(HeapFlags::NONE, ptr).unwrap();
                }
                criterion::black_box(heap.compact(HeapFlags::NONE));
            });
        });
    }
    group.finish();
}

fn bench_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("resize");
    group.bench_function("grow_64_to_4096", |b| {
        let mut heap = core(HeapFlags::NONE);
        b.iter(|| {
            let mut ptr = heap.allocate(HeapFlags::NONE, 64).unwrap();
            let mut size = 64;
            while size < 4096 {
                size *= 2;
                ptr = heap.resize(HeapFlags::NONE, ptr, size).unwrap();
            }
            heap.deallocate(HeapFlags::NONE, ptr).unwrap();
        });
    });
    group.finish();
}

fn bench_validate_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("inspect");
    let mut heap = core(HeapFlags::NONE);
    let ptrs: Vec<usize> = (0..512)
        .map(|i| heap.allocate(HeapFlags::NONE, 32 + (i % 17) * 48).unwrap())
        .collect();
    for ptr in ptrs.iter().step_by(3) {
        heap.deallocate(HeapFlags::NONE, *ptr).unwrap();
    }

    group.bench_function("validate_512", |b| {
        b.iter(|| criterion::black_box(heap.validate(HeapFlags::NONE, None)));
    });
    group.bench_function("walk_512", |b| {
        b.iter(|| {
            let mut cursor = rtlheap_core::WalkCursor::new();
            let mut n = 0usize;
            while heap.walk(&mut cursor).unwrap().is_some() {
                n += 1;
            }
            criterion::black_box(n)
        });
    });
    group.finish();
}

fn bench_handle_api(c: &mut Criterion) {
    let handle = rtlheap_abi::heap_create(HeapFlags::GROWABLE.bits(), 0, 0);
    c.bench_function("abi_alloc_free_64", |b| {
        b.iter(|| {
            let ptr = rtlheap_abi::heap_alloc(handle, 0, 64);
            rtlheap_abi::heap_free(handle, 0, criterion::black_box(ptr))
        });
    });
    rtlheap_abi::heap_destroy(handle);
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_resize,
    bench_validate_walk,
    bench_handle_api
);
criterion_main!(benches);
