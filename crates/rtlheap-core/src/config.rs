//! Heap configuration.
//!
//! Per-heap tunables live in [`HeapConfig`]. Process-wide defaults are read
//! from the environment once and cached:
//! - `RTLHEAP_CORRUPTION`: `report` (default) returns corruption as an
//!   ordinary error; `terminate` escalates it to a fatal failure.
//! - `RTLHEAP_LOG`: `trace|debug|info|warn|error`, the lifecycle log
//!   threshold (default `warn`).
//! - `RTLHEAP_VALIDATE`: `off` (default) or `all` to validate the whole heap
//!   before every mutating call.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::backing::PAGE_SIZE;
use crate::log::HeapLogLevel;

/// Allocations of at least this many bytes get a dedicated region.
pub const DEFAULT_LARGE_THRESHOLD: usize = 0x7_f000;
/// Reservation size of the first subheap when none is given.
pub const DEFAULT_SUBHEAP_SIZE: usize = 0x11_0000;
/// Commit step inside a subheap.
pub const DEFAULT_COMMIT_GRANULARITY: usize = 0x1_0000;
/// Upper bound of the subheap growth hint.
pub const DEFAULT_MAX_GROW_SIZE: usize = 128 * 1024 * 1024;
/// Delayed-free ring length when free checking is enabled.
pub const DEFAULT_PENDING_FREE_SLOTS: usize = 1024;
/// Lifecycle records kept per heap.
pub const DEFAULT_LOG_CAPACITY: usize = 256;

/// Response to metadata corruption found in a caller-supplied block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionPolicy {
    /// Fail the call with a corruption error and leave metadata untouched.
    #[default]
    Report,
    /// Same as `Report`, but the error is wrapped in `Fatal`.
    Terminate,
}

impl CorruptionPolicy {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminate" | "abort" | "fatal" => Self::Terminate,
            _ => Self::Report,
        }
    }
}

/// Heap-wide validation before each mutating call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidateMode {
    #[default]
    Off,
    All,
}

impl ValidateMode {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "on" | "1" | "full" => Self::All,
            _ => Self::Off,
        }
    }
}

/// Per-heap tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub large_threshold: usize,
    pub default_subheap_size: usize,
    /// Power of two, at least one page.
    pub commit_granularity: usize,
    pub max_grow_size: usize,
    pub pending_free_slots: usize,
    pub log_capacity: usize,
    pub log_level: HeapLogLevel,
    pub corruption_policy: CorruptionPolicy,
    pub validate_mode: ValidateMode,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            default_subheap_size: DEFAULT_SUBHEAP_SIZE,
            commit_granularity: DEFAULT_COMMIT_GRANULARITY,
            max_grow_size: DEFAULT_MAX_GROW_SIZE,
            pending_free_slots: DEFAULT_PENDING_FREE_SLOTS,
            log_capacity: DEFAULT_LOG_CAPACITY,
            log_level: HeapLogLevel::default(),
            corruption_policy: CorruptionPolicy::default(),
            validate_mode: ValidateMode::default(),
        }
    }
}

impl HeapConfig {
    /// Defaults overlaid with the cached environment settings.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            log_level: log_level(),
            corruption_policy: corruption_policy(),
            validate_mode: validate_mode(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_large_threshold(mut self, threshold: usize) -> Self {
        self.large_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_default_subheap_size(mut self, size: usize) -> Self {
        self.default_subheap_size = size.max(PAGE_SIZE);
        self
    }

    #[must_use]
    pub fn with_commit_granularity(mut self, granularity: usize) -> Self {
        self.commit_granularity = granularity.max(PAGE_SIZE).next_power_of_two();
        self
    }

    #[must_use]
    pub fn with_max_grow_size(mut self, size: usize) -> Self {
        self.max_grow_size = size;
        self
    }

    #[must_use]
    pub fn with_pending_free_slots(mut self, slots: usize) -> Self {
        self.pending_free_slots = slots;
        self
    }

    #[must_use]
    pub fn with_log(mut self, capacity: usize, level: HeapLogLevel) -> Self {
        self.log_capacity = capacity;
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_corruption_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.corruption_policy = policy;
        self
    }

    #[must_use]
    pub fn with_validate_mode(mut self, mode: ValidateMode) -> Self {
        self.validate_mode = mode;
        self
    }
}

// Atomic caches: 0=unresolved, 255=resolving, otherwise encoded value + 1.
static CACHED_POLICY: AtomicU8 = AtomicU8::new(0);
static CACHED_LOG_LEVEL: AtomicU8 = AtomicU8::new(0);
static CACHED_VALIDATE: AtomicU8 = AtomicU8::new(0);

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

/// Reads `var` once per process; concurrent callers see `fallback` until the
/// resolving thread stores its value.
fn resolve_cached(cache: &AtomicU8, var: &str, parse: fn(&str) -> u8, fallback: u8) -> u8 {
    let cached = cache.load(Ordering::Acquire);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached - 1;
    }
    if cached == RESOLVING
        || cache
            .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
    {
        let v = cache.load(Ordering::Acquire);
        return if v != UNRESOLVED && v != RESOLVING {
            v - 1
        } else {
            fallback
        };
    }
    let value = std::env::var(var).map(|v| parse(&v)).unwrap_or(fallback);
    cache.store(value + 1, Ordering::Release);
    value
}

fn policy_to_u8(policy: CorruptionPolicy) -> u8 {
    match policy {
        CorruptionPolicy::Report => 0,
        CorruptionPolicy::Terminate => 1,
    }
}

fn level_to_u8(level: HeapLogLevel) -> u8 {
    level as u8
}

fn u8_to_level(v: u8) -> HeapLogLevel {
    match v {
        0 => HeapLogLevel::Trace,
        1 => HeapLogLevel::Debug,
        2 => HeapLogLevel::Info,
        4 => HeapLogLevel::Error,
        _ => HeapLogLevel::Warn,
    }
}

/// Process default for [`CorruptionPolicy`] (`RTLHEAP_CORRUPTION`).
#[must_use]
pub fn corruption_policy() -> CorruptionPolicy {
    let v = resolve_cached(
        &CACHED_POLICY,
        "RTLHEAP_CORRUPTION",
        |s| policy_to_u8(CorruptionPolicy::from_str_loose(s)),
        policy_to_u8(CorruptionPolicy::Report),
    );
    if v == 1 {
        CorruptionPolicy::Terminate
    } else {
        CorruptionPolicy::Report
    }
}

/// Process default log threshold (`RTLHEAP_LOG`).
#[must_use]
pub fn log_level() -> HeapLogLevel {
    u8_to_level(resolve_cached(
        &CACHED_LOG_LEVEL,
        "RTLHEAP_LOG",
        |s| level_to_u8(HeapLogLevel::from_str_loose(s).unwrap_or_default()),
        level_to_u8(HeapLogLevel::Warn),
    ))
}

/// Process default validation mode (`RTLHEAP_VALIDATE`).
#[must_use]
pub fn validate_mode() -> ValidateMode {
    let v = resolve_cached(
        &CACHED_VALIDATE,
        "RTLHEAP_VALIDATE",
        |s| u8::from(ValidateMode::from_str_loose(s) == ValidateMode::All),
        0,
    );
    if v == 1 { ValidateMode::All } else { ValidateMode::Off }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = HeapConfig::default();
        assert_eq!(config.large_threshold, 0x7f000);
        assert_eq!(config.default_subheap_size, 0x110000);
        assert_eq!(config.commit_granularity, 0x10000);
        assert_eq!(config.corruption_policy, CorruptionPolicy::Report);
        assert_eq!(config.validate_mode, ValidateMode::Off);
        assert_eq!(config.log_level, HeapLogLevel::Warn);
    }

    #[test]
    fn builders_normalize() {
        let config = HeapConfig::default()
            .with_commit_granularity(5000)
            .with_large_threshold(0)
            .with_default_subheap_size(1);
        assert_eq!(config.commit_granularity, 8192);
        assert_eq!(config.large_threshold, 1);
        assert_eq!(config.default_subheap_size, PAGE_SIZE);
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(CorruptionPolicy::from_str_loose("TERMINATE"), CorruptionPolicy::Terminate);
        assert_eq!(CorruptionPolicy::from_str_loose("report"), CorruptionPolicy::Report);
        assert_eq!(CorruptionPolicy::from_str_loose("bogus"), CorruptionPolicy::Report);
        assert_eq!(ValidateMode::from_str_loose("all"), ValidateMode::All);
        assert_eq!(ValidateMode::from_str_loose(""), ValidateMode::Off);
    }

    #[test]
    fn level_encoding_roundtrips() {
        for level in [
            HeapLogLevel::Trace,
            HeapLogLevel::Debug,
            HeapLogLevel::Info,
            HeapLogLevel::Warn,
            HeapLogLevel::Error,
        ] {
            assert_eq!(u8_to_level(level_to_u8(level)), level);
        }
    }

    #[test]
    fn cached_resolution_is_stable() {
        let first = corruption_policy();
        assert_eq!(corruption_policy(), first);
        let level = log_level();
        assert_eq!(log_level(), level);
        assert_eq!(validate_mode(), validate_mode());
    }
}
