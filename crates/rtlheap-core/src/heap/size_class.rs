//! Free-list bucket classes.
//!
//! Buckets are keyed by the total arena size (header included). The first
//! fourteen cover 48..=256 bytes in 16-byte steps, so every block in one of
//! them fits any request that maps to the same bucket. The last four cover
//! exponentially wider ranges and need a scan.

/// Number of free-list buckets.
pub const NUM_BUCKETS: usize = 18;

/// Buckets below this index hold a single 16-byte size class.
pub const NUM_EXACT_BUCKETS: usize = 14;

/// Lower bound (inclusive) of each bucket.
const BUCKET_TABLE: [usize; NUM_BUCKETS] = [
    48, 64, 80, 96, 112, 128, 144, 160, // 16-byte steps
    176, 192, 208, 224, 240, 256, // up to 0x100
    0x110, 0x210, 0x410, 0x1010, // up to 0x200, 0x400, 0x1000, unbounded
];

/// Bucket holding free blocks of `total` bytes.
pub fn bucket_index(total: usize) -> usize {
    if total < BUCKET_TABLE[0] {
        return 0;
    }
    if total < BUCKET_TABLE[NUM_EXACT_BUCKETS] {
        return ((total - BUCKET_TABLE[0]) / 16).min(NUM_EXACT_BUCKETS - 1);
    }
    BUCKET_TABLE
        .iter()
        .rposition(|&lower| lower <= total)
        .unwrap_or(0)
}
