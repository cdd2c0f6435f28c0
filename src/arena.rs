use std::ptr::NonNull;

use crate::{
    block::{GRANULE, MemBlock},
    error::{HeapError, Result},
};

/// Typed window over the raw bytes of the heap arena.
///
/// Free region headers live inside the arena itself, so somebody has to
/// turn an offset into a [`MemBlock`] and back. That somebody is this
/// struct, and nothing else in the crate touches arena memory through a
/// raw pointer.
///
/// ```text
///   base                                                  base + bound
///    |                                                         |
///    v                                                         v
///    +-----------+----------------+-----------+----------------+
///    | MemBlock  |   allocated    | MemBlock  |   allocated    |
///    |  (free)   |                |  (free)   |                |
///    +-----------+----------------+-----------+----------------+
///    ^ offset 0                   ^ offset n
/// ```
///
/// Every access is checked against `[0, bound)`: the offset must be aligned
/// to [`GRANULE`] and the whole span the header claims must fit in the arena.
/// A check that fails is reported as [`HeapError::CorruptionDetected`], since
/// offsets only ever come from the free list.
#[derive(Debug)]
pub(crate) struct Arena {
    base: NonNull<u8>,
    bound: usize,
}

// SAFETY: the arena is exclusively owned by one free list, which is only
// reached through a lock.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates a window over `bound` bytes starting at `base`.
    ///
    /// **SAFETY**: `base..base + bound` must be valid for reads and writes and
    /// must not be used by anybody else while the arena exists. `base` must be
    /// aligned to [`GRANULE`] and `bound` must be a multiple of it.
    pub unsafe fn new(base: NonNull<u8>, bound: usize) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % GRANULE, 0);
        debug_assert_eq!(bound % GRANULE, 0);

        Self { base, bound }
    }

    #[inline]
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Offset of `ptr` from the arena base, if `base <= ptr <= base + bound`.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize).checked_sub(self.base.as_ptr() as usize)?;

        (offset <= self.bound).then_some(offset)
    }

    /// Address of the byte at `offset`, which may be one past the end.
    pub fn pointer_at(&self, offset: usize) -> Result<NonNull<u8>> {
        if offset > self.bound {
            return Err(HeapError::CorruptionDetected { offset, length: 0 });
        }

        // SAFETY: `offset` is within the arena (or one past its end), so the
        // result stays inside the same allocation.
        Ok(unsafe { self.base.add(offset) })
    }

    /// Reads the header stored at `offset`.
    pub fn read(&self, offset: usize) -> Result<MemBlock> {
        let header = self.header_ptr(offset)?;

        // SAFETY: `header_ptr` checked that the header is aligned and inside
        // the arena.
        let block = unsafe { header.as_ptr().read() };

        self.check_span(offset, block.length)?;

        Ok(block)
    }

    /// Writes `block` as the header of the region at `offset`.
    pub fn write(&mut self, offset: usize, block: MemBlock) -> Result<()> {
        self.check_span(offset, block.length)?;
        let header = self.header_ptr(offset)?;

        // SAFETY: same as in `read`, and we hold the arena mutably.
        unsafe { header.as_ptr().write(block) };

        Ok(())
    }

    fn header_ptr(&self, offset: usize) -> Result<NonNull<MemBlock>> {
        let fits = offset
            .checked_add(GRANULE)
            .is_some_and(|end| end <= self.bound);

        if offset % GRANULE != 0 || !fits {
            return Err(HeapError::CorruptionDetected {
                offset,
                length: GRANULE,
            });
        }

        Ok(self.pointer_at(offset)?.cast())
    }

    /// A region must be a non-empty multiple of the granule lying entirely
    /// inside the arena.
    fn check_span(&self, offset: usize, length: usize) -> Result<()> {
        let fits = offset
            .checked_add(length)
            .is_some_and(|end| end <= self.bound);

        if length < GRANULE || length % GRANULE != 0 || !fits {
            return Err(HeapError::CorruptionDetected { offset, length });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Backing([u8; 8 * GRANULE]);

    fn arena(backing: &mut Backing) -> Arena {
        let base = NonNull::new(backing.0.as_mut_ptr()).unwrap();
        unsafe { Arena::new(base, backing.0.len()) }
    }

    #[test]
    fn write_then_read_header() {
        let mut backing = Backing([0; 8 * GRANULE]);
        let mut arena = arena(&mut backing);

        let block = MemBlock::new(Some(4 * GRANULE), 2 * GRANULE);
        arena.write(GRANULE, block).unwrap();

        assert_eq!(arena.read(GRANULE).unwrap(), block);
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let mut backing = Backing([0; 8 * GRANULE]);
        let arena = arena(&mut backing);

        assert!(matches!(
            arena.read(1),
            Err(HeapError::CorruptionDetected { offset: 1, .. })
        ));
    }

    #[test]
    fn header_past_the_end_is_rejected() {
        let mut backing = Backing([0; 8 * GRANULE]);
        let mut arena = arena(&mut backing);

        let block = MemBlock::new(None, GRANULE);
        assert!(arena.write(8 * GRANULE, block).is_err());
        assert!(arena.read(8 * GRANULE).is_err());
    }

    #[test]
    fn span_past_the_end_is_rejected() {
        let mut backing = Backing([0; 8 * GRANULE]);
        let mut arena = arena(&mut backing);

        let block = MemBlock::new(None, 2 * GRANULE);
        assert!(arena.write(7 * GRANULE, block).is_err());
    }

    #[test]
    fn garbage_header_is_reported() {
        let mut backing = Backing([0xff; 8 * GRANULE]);
        let arena = arena(&mut backing);

        assert!(matches!(
            arena.read(0),
            Err(HeapError::CorruptionDetected { offset: 0, .. })
        ));
    }

    #[test]
    fn offsets_are_inclusive_of_the_bound() {
        let mut backing = Backing([0; 8 * GRANULE]);
        let arena = arena(&mut backing);

        let end = arena.pointer_at(arena.bound()).unwrap();
        assert_eq!(arena.offset_of(end), Some(8 * GRANULE));
        let base = arena.pointer_at(0).unwrap();
        assert_eq!(arena.offset_of(base), Some(0));

        let before = NonNull::new(base.as_ptr().wrapping_sub(1)).unwrap();
        assert_eq!(arena.offset_of(before), None);
    }

    #[test]
    fn pointers_past_the_end_are_rejected() {
        let mut backing = Backing([0; 8 * GRANULE]);
        let arena = arena(&mut backing);

        assert_eq!(
            arena.pointer_at(arena.bound() + GRANULE),
            Err(HeapError::CorruptionDetected {
                offset: 9 * GRANULE,
                length: 0,
            })
        );
        assert!(arena.pointer_at(usize::MAX).is_err());
    }
}
