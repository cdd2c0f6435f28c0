use std::mem;

/// Granularity unit of the heap. Every request is rounded up to a multiple
/// of this and every block handed out is aligned to it.
///
/// It has to be at least the size of the free region header, otherwise a
/// released block could be too small to describe itself.
pub const GRANULE: usize = mem::size_of::<MemBlock>();

/// Header of a free region. It is stored in-place, in the first bytes of the
/// region it describes:
///
/// ```text
/// +---------------------+ <------+
/// |        next         |        |
/// +---------------------+        | -> MemBlock
/// |       length        |        |
/// +---------------------+ <------+
/// |                     |
/// |    Free Payload     |
/// |      (unused)       |
/// |         ...         |
/// +---------------------+ <- offset + length
/// ```
///
/// Links are offsets from the arena base rather than pointers, so a header
/// never holds an address outside of the arena it lives in. The tail stores
/// [`NIL`] as its link.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemBlock {
    /// Offset of the next free region, [`NIL`] on the tail.
    pub next: usize,
    /// Length of this region in bytes, always a multiple of [`GRANULE`].
    pub length: usize,
}

/// Link value of the last region in the ledger.
pub(crate) const NIL: usize = usize::MAX;

impl MemBlock {
    pub const fn new(next: Option<usize>, length: usize) -> Self {
        let next = match next {
            Some(offset) => offset,
            None => NIL,
        };

        Self { next, length }
    }

    /// Offset of the next free region, if any.
    #[inline]
    pub fn next(&self) -> Option<usize> {
        (self.next != NIL).then_some(self.next)
    }
}
