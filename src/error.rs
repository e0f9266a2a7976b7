//! Error taxonomy for the loader.
//!
//! One variant per documented failure kind (spec §7). Integrity,
//! parse, and span-overrun errors are fatal and propagate unchanged;
//! not-found on an optional tensor never reaches this type — callers
//! recover it locally (see `resolver.rs`, `weights.rs`).

use std::fmt;

/// A `(shard_index, offset, size)` window, used in integrity and
/// span-overrun diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub offset: u64,
    pub size: u64,
}

impl fmt::Display for ByteWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.offset + self.size)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// Device unavailable or a requested feature (e.g. 16-bit float) is
    /// missing. Note: per spec §7 this is only raised when there is no
    /// usable fallback — F16-on-unsupported-device is NOT an error, it
    /// is a silent downcast skip (see `weights.rs`).
    #[error("capability unavailable: {0}")]
    Capability(String),

    /// Manifest missing required keys, malformed tensor entry, or
    /// unknown dtype/hash-algorithm tag.
    #[error("manifest parse error: {0}")]
    Parse(String),

    /// Shard missing from the source, size mismatch, or hash mismatch.
    #[error("integrity failure: shard {shard_index} — {reason}")]
    Integrity { shard_index: usize, reason: String },

    /// A span's `offset + size` exceeds the fetched shard's length.
    #[error(
        "span overrun: tensor '{tensor}' shard {shard_index} requires {required} but shard is {actual} bytes ({hint})"
    )]
    SpanOverrun {
        tensor: String,
        shard_index: usize,
        required: ByteWindow,
        actual: u64,
        hint: &'static str,
    },

    /// A required tensor could not be resolved under any known alias.
    #[error("required tensor not found: {0}")]
    NotFound(String),

    /// Buffer acquisition, queue write, or kernel dispatch failed.
    #[error("device error: {0}")]
    Device(String),

    /// Cooperative cancellation at a suspension point.
    #[error("load cancelled")]
    Cancelled,
}

impl LoaderError {
    pub fn span_overrun(tensor: &str, shard_index: usize, offset: u64, size: u64, actual: u64) -> Self {
        LoaderError::SpanOverrun {
            tensor: tensor.to_string(),
            shard_index,
            required: ByteWindow { offset, size },
            actual,
            hint: "check for a stale shard cache entry or a corrupt/truncated download",
        }
    }
}

impl From<candle_core::Error> for LoaderError {
    fn from(e: candle_core::Error) -> Self {
        LoaderError::Device(e.to_string())
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(e: serde_json::Error) -> Self {
        LoaderError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;
