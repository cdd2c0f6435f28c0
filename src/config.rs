//! Heap configuration parameters.

use crate::{
    block::GRANULE,
    error::{HeapError, Result},
};

/// Configuration for a heap backed by platform memory.
///
/// Validated by [`crate::MemHeap::map`]; immutable once the heap exists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of the arena in bytes.
    ///
    /// Rounded down to a multiple of [`GRANULE`]. Must hold at least one
    /// granule. Default: 64 KiB.
    pub arena_bytes: usize,

    /// Dump the whole free list at `trace` level after every allocation and
    /// release.
    ///
    /// The dump allocates, so leave this off when the heap serves the
    /// process' own allocations.
    pub trace_ledger: bool,
}

impl HeapConfig {
    /// Default arena size: 64 KiB.
    pub const DEFAULT_ARENA_BYTES: usize = 64 * 1024;

    /// Create a config for an arena of `arena_bytes`, without tracing.
    pub fn new(arena_bytes: usize) -> Self {
        Self {
            arena_bytes,
            trace_ledger: false,
        }
    }

    pub fn with_trace_ledger(mut self, trace_ledger: bool) -> Self {
        self.trace_ledger = trace_ledger;
        self
    }

    /// Checks that the arena can hold at least one block.
    pub fn validate(&self) -> Result<()> {
        if self.arena_bytes < GRANULE {
            return Err(HeapError::InvalidArgument {
                reason: "arena must hold at least one granule",
            });
        }

        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ARENA_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_arena_is_64k() {
        let config = HeapConfig::default();
        assert_eq!(config.arena_bytes, 64 * 1024);
        assert!(!config.trace_ledger);
        config.validate().unwrap();
    }

    #[test]
    fn arena_smaller_than_a_granule_is_invalid() {
        assert!(HeapConfig::new(GRANULE - 1).validate().is_err());
        assert!(HeapConfig::new(GRANULE).validate().is_ok());
    }

    #[test]
    fn trace_ledger_builder() {
        assert!(HeapConfig::new(1024).with_trace_ledger(true).trace_ledger);
    }
}
