//! Deterministic allocate/free/resize workloads.
//!
//! A workload is fully determined by its [`WorkloadSpec`]; the same spec run
//! against a fresh heap always performs the same calls and yields the same
//! [`WorkloadStats`] and walk digest.

use serde::{Deserialize, Serialize};

use rtlheap_core::{HeapFlags, HeapOps};

use crate::error::HarnessError;

/// XorShift64 sequence; never seeded with zero.
#[derive(Debug, Clone)]
pub struct XorShift64(u64);

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub seed: u64,
    pub steps: usize,
    /// Upper bound for ordinary request sizes.
    pub max_size: usize,
    /// Every n-th allocation asks for `large_size` bytes instead; 0 disables.
    pub large_every: usize,
    pub large_size: usize,
    /// Live blocks kept at most; beyond it the workload frees.
    pub max_live: usize,
    /// Whole-heap validation every n steps; 0 validates only at the end.
    pub validate_every: usize,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            seed: 0x5eed,
            steps: 2000,
            max_size: 2048,
            large_every: 0,
            large_size: 0x10_0000,
            max_live: 256,
            validate_every: 250,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStats {
    pub allocations: usize,
    pub frees: usize,
    pub resizes: usize,
    pub moved: usize,
    pub failures: usize,
    pub validations: usize,
    pub peak_live: usize,
    pub final_live: usize,
}

#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: usize,
    size: usize,
    tag: u8,
}

/// Byte pattern written into the first bytes of every block.
fn stamp(tag: u8, size: usize) -> Vec<u8> {
    (0..size.min(32)).map(|i| tag.wrapping_add(i as u8)).collect()
}

/// Runs `spec` against `heap`. Blocks still live at the end are freed only
/// if `release` is set, so callers can walk a populated heap.
pub fn run_workload(
    heap: &impl HeapOps,
    spec: &WorkloadSpec,
    release: bool,
) -> Result<WorkloadStats, HarnessError> {
    let mut rng = XorShift64::new(spec.seed);
    let mut live: Vec<Live> = Vec::new();
    let mut stats = WorkloadStats::default();

    for step in 0..spec.steps {
        let roll = rng.below(10);
        if live.is_empty() || (roll < 5 && live.len() < spec.max_live) {
            stats.allocations += 1;
            let large = spec.large_every != 0 && stats.allocations % spec.large_every == 0;
            let size = if large {
                spec.large_size
            } else {
                rng.below(spec.max_size as u64) as usize + 1
            };
            match heap.allocate(HeapFlags::NONE, size) {
                Ok(ptr) => {
                    let tag = rng.next_u64() as u8;
                    heap.write(ptr, 0, &stamp(tag, size))?;
                    live.push(Live { ptr, size, tag });
                }
                Err(_) => stats.failures += 1,
            }
        } else if roll < 8 {
            let idx = rng.below(live.len() as u64) as usize;
            let block = live.swap_remove(idx);
            check_block(heap, &block, step)?;
            heap.deallocate(HeapFlags::NONE, block.ptr)?;
            stats.frees += 1;
        } else {
            let idx = rng.below(live.len() as u64) as usize;
            let new_size = rng.below(spec.max_size as u64 * 2) as usize + 1;
            check_block(heap, &live[idx], step)?;
            stats.resizes += 1;
            match heap.resize(HeapFlags::NONE, live[idx].ptr, new_size) {
                Ok(ptr) => {
                    if ptr != live[idx].ptr {
                        stats.moved += 1;
                    }
                    let kept = live[idx].size.min(new_size);
                    live[idx] = Live {
                        ptr,
                        size: kept,
                        tag: live[idx].tag,
                    };
                    check_block(heap, &live[idx], step)?;
                    live[idx].size = new_size;
                    heap.write(ptr, 0, &stamp(live[idx].tag, new_size))?;
                }
                Err(_) => stats.failures += 1,
            }
        }
        stats.peak_live = stats.peak_live.max(live.len());

        if spec.validate_every != 0 && (step + 1) % spec.validate_every == 0 {
            stats.validations += 1;
            if !heap.validate(HeapFlags::NONE, None) {
                return Err(HarnessError::Invalid { step });
            }
        }
    }

    stats.validations += 1;
    if !heap.validate(HeapFlags::NONE, None) {
        return Err(HarnessError::Invalid { step: spec.steps });
    }
    stats.final_live = live.len();
    if release {
        for block in live.drain(..) {
            heap.deallocate(HeapFlags::NONE, block.ptr)?;
            stats.frees += 1;
        }
    }
    Ok(stats)
}

fn check_block(heap: &impl HeapOps, block: &Live, step: usize) -> Result<(), HarnessError> {
    let expected = stamp(block.tag, block.size);
    let mut actual = vec![0u8; expected.len()];
    heap.read(block.ptr, 0, &mut actual)?;
    if actual != expected {
        return Err(HarnessError::ContentMismatch {
            addr: block.ptr,
            step,
        });
    }
    Ok(())
}
