use crate::{
    arena::Arena,
    block::{GRANULE, MemBlock},
    error::{HeapError, Result},
};

/// A span of free bytes, as seen from outside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreeRegion {
    /// Offset of the first byte from the arena base.
    pub offset: usize,
    /// Length of the region in bytes.
    pub length: usize,
}

impl FreeRegion {
    /// Offset one past the last byte of the region.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Address ordered list of the free regions of an [`Arena`], plus the total
/// number of free bytes.
///
/// Every free region stores its own [`MemBlock`] header in its first bytes,
/// so the list needs no memory besides the arena it describes:
///
/// ```text
///
///   head                 next                        next
///    |          +-------------------+        +--------------------+
///    |          |                   |        |                    |
/// +--v----------|-+----------+------v--------|-+----------+-------v------+
/// | Free (len)  | | Block    | Free (len)    | | Block    | Free (NIL)   |
/// +---------------+----------+-----------------+----------+--------------+
///
/// ```
///
/// Whenever a public operation returns, the list holds these invariants:
///
/// 1. Regions are sorted by offset.
/// 2. No two regions overlap.
/// 3. No two regions are adjacent: they are merged as soon as they touch.
/// 4. Every length is a non-zero multiple of [`GRANULE`].
/// 5. `size` is the sum of all region lengths.
pub(crate) struct FreeList {
    arena: Arena,
    head: Option<usize>,
    size: usize,
}

impl FreeList {
    /// Creates a list holding the whole `arena` as a single free region.
    pub fn new(mut arena: Arena) -> Result<Self> {
        let bound = arena.bound();
        arena.write(0, MemBlock::new(None, bound))?;

        Ok(Self {
            arena,
            head: Some(0),
            size: bound,
        })
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Total number of free bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Takes `need` bytes out of the first region that can hold them and
    /// returns the offset of the carved block.
    ///
    /// This is first-fit with remainder splitting: the caller gets the low
    /// end of the region and the high end stays in the list, in the same
    /// position. `need` must already be rounded to [`GRANULE`].
    pub fn take(&mut self, need: usize) -> Result<usize> {
        debug_assert!(need >= GRANULE && need % GRANULE == 0);

        let mut prev: Option<(usize, MemBlock)> = None;
        let mut current = self.head;

        while let Some(offset) = current {
            let block = self.arena.read(offset)?;
            let next = successor(offset, &block)?;

            if block.length >= need {
                let replacement = if block.length == need {
                    next
                } else {
                    let leftover = offset + need;
                    self.arena
                        .write(leftover, MemBlock::new(next, block.length - need))?;

                    Some(leftover)
                };

                self.link(prev, replacement)?;
                self.size -= need;

                return Ok(offset);
            }

            prev = Some((offset, block));
            current = next;
        }

        Err(HeapError::OutOfMemory {
            requested: need,
            available: self.size,
        })
    }

    /// Returns `length` bytes at `offset` to the list.
    ///
    /// The block is placed by address between its predecessor and successor
    /// and then merged with whichever of them it touches. If it overlaps any
    /// of them nothing is written and [`HeapError::CorruptionDetected`] is
    /// returned.
    pub fn insert(&mut self, offset: usize, length: usize) -> Result<()> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.arena.bound())
            .ok_or(HeapError::CorruptionDetected { offset, length })?;

        // Find the insertion point. Nothing is written until both
        // neighbours have been read and checked.
        let mut prev: Option<(usize, MemBlock)> = None;
        let mut current = self.head;

        while let Some(at) = current.filter(|at| *at < offset) {
            let block = self.arena.read(at)?;
            current = successor(at, &block)?;
            prev = Some((at, block));
        }

        if let Some((at, block)) = prev {
            if at + block.length > offset {
                return Err(HeapError::CorruptionDetected { offset, length });
            }
        }

        let next = match current {
            Some(at) if at < end => {
                return Err(HeapError::CorruptionDetected { offset, length });
            }
            Some(at) => Some((at, self.arena.read(at)?)),
            None => None,
        };

        let mut block = MemBlock::new(current, length);

        if let Some((at, next_block)) = next {
            if at == end {
                block.length += next_block.length;
                block.next = next_block.next;
            }
        }

        match prev {
            Some((at, mut prev_block)) if at + prev_block.length == offset => {
                prev_block.length += block.length;
                prev_block.next = block.next;
                self.arena.write(at, prev_block)?;
            }
            _ => {
                self.arena.write(offset, block)?;
                self.link(prev, Some(offset))?;
            }
        }

        self.size += length;

        Ok(())
    }

    /// Iterates over the regions in address order.
    pub fn regions(&self) -> Regions<'_> {
        Regions {
            arena: &self.arena,
            current: self.head,
        }
    }

    /// Walks the whole list and verifies every invariant.
    pub fn check(&self) -> Result<()> {
        let mut total = 0usize;
        let mut last_end: Option<usize> = None;

        for region in self.regions() {
            let region = region?;

            if last_end.is_some_and(|end| region.offset <= end) {
                return Err(HeapError::CorruptionDetected {
                    offset: region.offset,
                    length: region.length,
                });
            }

            total += region.length;
            last_end = Some(region.end());
        }

        if total != self.size {
            return Err(HeapError::CorruptionDetected {
                offset: 0,
                length: total,
            });
        }

        Ok(())
    }

    /// Points the predecessor `prev` (or the head when there is none) at `to`.
    fn link(&mut self, prev: Option<(usize, MemBlock)>, to: Option<usize>) -> Result<()> {
        match prev {
            Some((at, block)) => self.arena.write(at, MemBlock::new(to, block.length)),
            None => {
                self.head = to;
                Ok(())
            }
        }
    }
}

/// Link of `block` stored at `offset`. A successor must start at or after
/// the end of its predecessor, which also keeps a corrupted list from
/// cycling.
fn successor(offset: usize, block: &MemBlock) -> Result<Option<usize>> {
    match block.next() {
        Some(next) if next < offset + block.length => Err(HeapError::CorruptionDetected {
            offset,
            length: block.length,
        }),
        next => Ok(next),
    }
}

/// Iterator over the regions of a [`FreeList`]. Yields an error and stops if
/// a header turns out to be corrupted.
pub(crate) struct Regions<'a> {
    arena: &'a Arena,
    current: Option<usize>,
}

impl Iterator for Regions<'_> {
    type Item = Result<FreeRegion>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.current?;

        let step = self
            .arena
            .read(offset)
            .and_then(|block| Ok((block, successor(offset, &block)?)));

        match step {
            Ok((block, next)) => {
                self.current = next;
                Some(Ok(FreeRegion {
                    offset,
                    length: block.length,
                }))
            }
            Err(err) => {
                self.current = None;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    const UNITS: usize = 16;

    #[repr(C, align(16))]
    struct Backing([u8; UNITS * GRANULE]);

    fn free_list(backing: &mut Backing) -> FreeList {
        let base = NonNull::new(backing.0.as_mut_ptr()).unwrap();
        let arena = unsafe { Arena::new(base, backing.0.len()) };
        FreeList::new(arena).unwrap()
    }

    fn spans(list: &FreeList) -> Vec<(usize, usize)> {
        list.regions()
            .map(|r| r.map(|r| (r.offset / GRANULE, r.length / GRANULE)))
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn new_list_covers_the_whole_arena() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let list = free_list(&mut backing);

        assert_eq!(spans(&list), vec![(0, UNITS)]);
        assert_eq!(list.size(), UNITS * GRANULE);
        list.check().unwrap();
    }

    #[test]
    fn take_splits_from_the_low_end() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        assert_eq!(list.take(3 * GRANULE).unwrap(), 0);
        assert_eq!(spans(&list), vec![(3, UNITS - 3)]);
        assert_eq!(list.size(), (UNITS - 3) * GRANULE);
        list.check().unwrap();
    }

    #[test]
    fn exact_fit_unlinks_the_region() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        let a = list.take(2 * GRANULE).unwrap();
        let _b = list.take(2 * GRANULE).unwrap();
        list.insert(a, 2 * GRANULE).unwrap();
        assert_eq!(spans(&list), vec![(0, 2), (4, UNITS - 4)]);

        assert_eq!(list.take(2 * GRANULE).unwrap(), a);
        assert_eq!(spans(&list), vec![(4, UNITS - 4)]);
        list.check().unwrap();
    }

    #[test]
    fn first_fit_ignores_tighter_regions_further_on() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        // Free regions of 3 units at 0 and 1 unit at 4.
        let a = list.take(3 * GRANULE).unwrap();
        let _ = list.take(GRANULE).unwrap();
        let c = list.take(GRANULE).unwrap();
        let _ = list.take(GRANULE).unwrap();
        list.insert(a, 3 * GRANULE).unwrap();
        list.insert(c, GRANULE).unwrap();

        assert_eq!(list.take(GRANULE).unwrap(), 0);
        assert_eq!(spans(&list), vec![(1, 2), (4, 1), (6, UNITS - 6)]);
    }

    #[test]
    fn insert_merges_with_both_neighbours() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        let a = list.take(GRANULE).unwrap();
        let b = list.take(GRANULE).unwrap();
        let c = list.take(GRANULE).unwrap();
        let _d = list.take(GRANULE).unwrap();

        list.insert(a, GRANULE).unwrap();
        list.insert(c, GRANULE).unwrap();
        assert_eq!(spans(&list), vec![(0, 1), (2, 1), (4, UNITS - 4)]);

        list.insert(b, GRANULE).unwrap();
        assert_eq!(spans(&list), vec![(0, 3), (4, UNITS - 4)]);
        list.check().unwrap();
    }

    #[test]
    fn insert_before_head_becomes_new_head() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        let a = list.take(GRANULE).unwrap();
        let _b = list.take(GRANULE).unwrap();

        list.insert(a, GRANULE).unwrap();
        assert_eq!(spans(&list), vec![(0, 1), (2, UNITS - 2)]);
        list.check().unwrap();
    }

    #[test]
    fn overlapping_insert_is_rejected_without_changes() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        let a = list.take(2 * GRANULE).unwrap();
        let _b = list.take(2 * GRANULE).unwrap();
        list.insert(a, 2 * GRANULE).unwrap();

        let before = spans(&list);
        let size = list.size();

        // Double release.
        assert!(matches!(
            list.insert(a, 2 * GRANULE),
            Err(HeapError::CorruptionDetected { .. })
        ));
        // Tail of the block runs into the free remainder.
        assert!(matches!(
            list.insert(2 * GRANULE, 3 * GRANULE),
            Err(HeapError::CorruptionDetected { .. })
        ));
        // Starts inside a free region.
        assert!(matches!(
            list.insert(GRANULE, GRANULE),
            Err(HeapError::CorruptionDetected { .. })
        ));

        assert_eq!(spans(&list), before);
        assert_eq!(list.size(), size);
    }

    #[test]
    fn exhausted_list_is_empty() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        list.take(UNITS * GRANULE).unwrap();
        assert_eq!(list.regions().count(), 0);
        assert_eq!(
            list.take(GRANULE),
            Err(HeapError::OutOfMemory {
                requested: GRANULE,
                available: 0,
            })
        );

        list.insert(0, UNITS * GRANULE).unwrap();
        assert_eq!(spans(&list), vec![(0, UNITS)]);
    }

    #[test]
    fn corrupted_header_is_detected() {
        let mut backing = Backing([0; UNITS * GRANULE]);
        let mut list = free_list(&mut backing);

        let _ = list.take(GRANULE).unwrap();
        // Scribble over the header of the remaining free region.
        let header = list.arena().pointer_at(GRANULE).unwrap().as_ptr();
        unsafe { header.write_bytes(0xab, GRANULE) };

        assert!(list.check().is_err());
        assert!(matches!(
            list.take(GRANULE),
            Err(HeapError::CorruptionDetected { .. })
        ));
    }
}
