//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

use crate::block::GRANULE;

/// It aligns `to_be_aligned` using `aligment`. `aligment` must be a power of two.
///
/// This is used to round mapped arenas up to a multiple of
/// [`crate::page_size`]. Returns `None` if the aligned value does not fit in
/// a `usize`.
pub fn align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    to_be_aligned
        .checked_add(aligment - 1)
        .map(|n| align_down(n, aligment))
}

/// Rounds `to_be_aligned` down to a multiple of `aligment`.
pub fn align_down(to_be_aligned: usize, aligment: usize) -> usize {
    to_be_aligned & !(aligment - 1)
}

/// Rounds a byte count up to the granularity unit of the heap.
///
/// Returns `None` if the rounded value does not fit in a `usize`.
#[inline]
pub fn round_mb(nbytes: usize) -> Option<usize> {
    nbytes
        .checked_add(GRANULE - 1)
        .map(|n| align_down(n, GRANULE))
}
