//! Structured heap lifecycle records.
//!
//! Each heap keeps a bounded ring of records. Records below the configured
//! threshold are never built; when the ring is full the oldest record is
//! dropped and counted.

use std::collections::VecDeque;

/// Heap lifecycle log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeapLogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl HeapLogLevel {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured heap lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id: `rtlheap::<symbol>::<id:016x>`.
    pub trace_id: String,
    pub level: HeapLogLevel,
    /// Heap operation (`allocate`, `free`, `resize`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `subheap_grow`, `corruption_detected`, ...).
    pub event: &'static str,
    /// Address involved in the event.
    pub addr: Option<usize>,
    /// Size involved in the event.
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: live block count.
    pub live_blocks: usize,
    /// Snapshot: live user bytes.
    pub live_bytes: usize,
}

#[derive(Debug)]
pub struct HeapLog {
    records: VecDeque<HeapLogRecord>,
    capacity: usize,
    threshold: HeapLogLevel,
    next_decision_id: u64,
    dropped: u64,
}

impl HeapLog {
    pub fn new(capacity: usize, threshold: HeapLogLevel) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            threshold,
            next_decision_id: 1,
            dropped: 0,
        }
    }

    pub fn enabled(&self, level: HeapLogLevel) -> bool {
        self.capacity > 0 && level >= self.threshold
    }

    pub fn threshold(&self) -> HeapLogLevel {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: HeapLogLevel) {
        self.threshold = threshold;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        level: HeapLogLevel,
        symbol: &'static str,
        event: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
        live: (usize, usize),
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(HeapLogRecord {
            decision_id,
            trace_id: format!("rtlheap::{symbol}::{decision_id:016x}"),
            level,
            symbol,
            event,
            addr,
            size,
            outcome,
            details: details.into(),
            live_blocks: live.0,
            live_bytes: live.1,
        });
    }

    /// Takes every buffered record, oldest first.
    pub fn drain(&mut self) -> Vec<HeapLogRecord> {
        self.records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records evicted because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(log: &mut HeapLog, level: HeapLogLevel, event: &'static str) {
        log.record(level, "allocate", event, Some(0x10), Some(8), "success", "", (1, 8));
    }

    #[test]
    fn threshold_filters_records() {
        let mut log = HeapLog::new(8, HeapLogLevel::Warn);
        push(&mut log, HeapLogLevel::Trace, "alloc");
        push(&mut log, HeapLogLevel::Error, "corruption_detected");
        let records = log.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "corruption_detected");
        assert_eq!(records[0].decision_id, 1);
        assert_eq!(records[0].trace_id, "rtlheap::allocate::0000000000000001");
        assert!(log.is_empty());
    }

    #[test]
    fn ring_drops_oldest() {
        let mut log = HeapLog::new(2, HeapLogLevel::Trace);
        push(&mut log, HeapLogLevel::Info, "a");
        push(&mut log, HeapLogLevel::Info, "b");
        push(&mut log, HeapLogLevel::Info, "c");
        assert_eq!(log.dropped(), 1);
        let events: Vec<_> = log.drain().into_iter().map(|r| r.event).collect();
        assert_eq!(events, vec!["b", "c"]);
    }

    #[test]
    fn zero_capacity_disables_logging() {
        let mut log = HeapLog::new(0, HeapLogLevel::Trace);
        push(&mut log, HeapLogLevel::Error, "x");
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn level_parsing() {
        assert_eq!(HeapLogLevel::from_str_loose("DEBUG"), Some(HeapLogLevel::Debug));
        assert_eq!(HeapLogLevel::from_str_loose("warning"), Some(HeapLogLevel::Warn));
        assert_eq!(HeapLogLevel::from_str_loose("loud"), None);
        assert!(HeapLogLevel::Error > HeapLogLevel::Warn);
        assert_eq!(HeapLogLevel::Info.as_str(), "info");
    }
}
