//! Harness error type.

use thiserror::Error;

use rtlheap_core::HeapError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
    #[error("heap failed validation after step {step}")]
    Invalid { step: usize },
    #[error("block {addr:#x} lost its contents after step {step}")]
    ContentMismatch { addr: usize, step: usize },
    #[error("{count} invalid log line(s)")]
    InvalidLog { count: usize },
}
