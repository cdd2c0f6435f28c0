//! Error types for the heap.

use thiserror::Error;

/// Errors returned by [`crate::MemHeap`] operations.
///
/// None of them is fatal: a failed call leaves the free list exactly as it
/// found it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// A zero byte allocation was requested.
    #[error("invalid request: cannot allocate 0 bytes")]
    InvalidRequest,

    /// No free region is large enough for the request.
    #[error("out of memory: requested {requested} bytes, {available} bytes free")]
    OutOfMemory {
        /// Request size after rounding to the granularity unit, saturated at
        /// `usize::MAX` when the rounding overflows.
        requested: usize,
        /// Free bytes left in the arena (possibly fragmented).
        available: usize,
    },

    /// The arguments do not describe a block of this arena.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the arguments.
        reason: &'static str,
    },

    /// A released block overlaps a free region, or the free list itself
    /// is inconsistent.
    #[error("corruption detected: block at offset {offset:#x} ({length} bytes) overlaps the free list")]
    CorruptionDetected {
        /// Offset of the offending span from the arena base.
        offset: usize,
        /// Length of the offending span.
        length: usize,
    },

    /// The platform refused to map memory for the arena.
    #[error("failed to map {len} bytes for the arena")]
    MapFailed {
        /// Number of bytes requested from the platform.
        len: usize,
    },
}

/// Result type for heap operations.
pub type Result<T> = std::result::Result<T, HeapError>;
