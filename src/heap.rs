use std::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::{
    arena::Arena,
    block::GRANULE,
    config::HeapConfig,
    critical::{CriticalSection, NoPreemption, Preemption},
    error::{HeapError, Result},
    freelist::{FreeList, FreeRegion},
    kernel::MappedArena,
    utils::{align_down, round_mb},
};

/// First-fit heap over a single contiguous arena.
///
/// The heap keeps an address ordered list of free regions. [`MemHeap::allocate`]
/// hands out the low end of the first region that is large enough and
/// [`MemHeap::release`] puts blocks back, merging them with the free regions
/// they touch:
///
/// ```text
///   allocate(n)                          release(ptr, n)
///
///   +--------------------------+         +------+------+------------+
///   |          Free            |         | Free | ptr  |    Free    |
///   +--------------------------+         +------+------+------------+
///               |                                   |
///               v                                   v
///   +-----+--------------------+         +--------------------------+
///   | ptr |        Free        |         |           Free           |
///   +-----+--------------------+         +--------------------------+
/// ```
///
/// Live blocks carry no header, so the caller has to pass the size it asked
/// for back to `release`.
///
/// Both operations run inside a critical section: preemption is disabled
/// through `P` and the free list is locked until the operation returns.
pub struct MemHeap<P: Preemption = NoPreemption> {
    ledger: Mutex<FreeList>,
    preemption: P,
    base: NonNull<u8>,
    bound: usize,
    trace_ledger: bool,
    // Declared after `ledger` so the memory outlives the list.
    _mapping: Option<MappedArena>,
}

// SAFETY: `base` is only handed out, never dereferenced; the arena behind
// it is only accessed through `ledger`.
unsafe impl<P: Preemption + Send> Send for MemHeap<P> {}
unsafe impl<P: Preemption + Sync> Sync for MemHeap<P> {}

impl<P: Preemption> MemHeap<P> {
    /// Creates a heap over the `bound` bytes starting at `base`.
    ///
    /// `bound` is rounded down to a multiple of [`GRANULE`]. Fails with
    /// [`HeapError::InvalidArgument`] if `base` is not aligned to
    /// [`GRANULE`] or the arena cannot hold a single granule.
    ///
    /// # Safety
    ///
    /// `base..base + bound` must be valid for reads and writes for the whole
    /// life of the heap, and nothing else may touch it except through blocks
    /// returned by [`MemHeap::allocate`].
    pub unsafe fn from_raw(base: NonNull<u8>, bound: usize, preemption: P) -> Result<Self> {
        if base.as_ptr() as usize % GRANULE != 0 {
            return Err(HeapError::InvalidArgument {
                reason: "arena base is not aligned to the granularity unit",
            });
        }

        let bound = align_down(bound, GRANULE);

        if bound < GRANULE {
            return Err(HeapError::InvalidArgument {
                reason: "arena must hold at least one granule",
            });
        }

        if (base.as_ptr() as usize).checked_add(bound).is_none() {
            return Err(HeapError::InvalidArgument {
                reason: "arena wraps around the address space",
            });
        }

        // SAFETY: guaranteed by the caller, alignment checked above.
        let arena = unsafe { Arena::new(base, bound) };
        let ledger = FreeList::new(arena)?;

        log::debug!("heap initialized at {base:p} with {bound} bytes");

        Ok(Self {
            ledger: Mutex::new(ledger),
            preemption,
            base,
            bound,
            trace_ledger: false,
            _mapping: None,
        })
    }

    /// Creates a heap over memory mapped from the platform.
    pub fn map(config: HeapConfig, preemption: P) -> Result<Self> {
        config.validate()?;

        let mapping = MappedArena::new(config.arena_bytes)?;

        // SAFETY: the mapping is owned by the heap and dropped after the
        // free list.
        let mut heap = unsafe { Self::from_raw(mapping.as_non_null(), config.arena_bytes, preemption)? };
        heap.trace_ledger = config.trace_ledger;
        heap._mapping = Some(mapping);

        Ok(heap)
    }

    /// Allocates at least `nbytes` bytes.
    ///
    /// The request is rounded up to [`GRANULE`] and the returned block is
    /// aligned to it.
    pub fn allocate(&self, nbytes: usize) -> Result<NonNull<u8>> {
        if nbytes == 0 {
            return Err(HeapError::InvalidRequest);
        }

        let taken = {
            let mut ledger = self.enter();

            match round_mb(nbytes) {
                Some(need) => ledger
                    .take(need)
                    .and_then(|offset| Ok((offset, ledger.arena().pointer_at(offset)?))),
                None => Err(HeapError::OutOfMemory {
                    requested: usize::MAX,
                    available: ledger.size(),
                }),
            }
        };

        let (offset, ptr) = taken.inspect_err(|err| log::debug!("allocate({nbytes}) failed: {err}"))?;

        log::debug!("allocated {nbytes} bytes at {ptr:p} (offset {offset:#x})");
        self.trace("allocate");

        Ok(ptr)
    }

    /// Returns a block to the heap.
    ///
    /// `nbytes` must be the size that was passed to [`MemHeap::allocate`].
    /// The block is merged with any free region right before or after it.
    ///
    /// Fails with [`HeapError::InvalidArgument`] if `nbytes` is zero or the
    /// block is not inside the arena, and with
    /// [`HeapError::CorruptionDetected`] if it overlaps a free region. In both
    /// cases the heap is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this heap with the same
    /// `nbytes`, and must not have been released since. A block that overlaps
    /// live memory without touching a free region cannot be detected.
    pub unsafe fn release(&self, ptr: NonNull<u8>, nbytes: usize) -> Result<()> {
        let released = {
            let mut ledger = self.enter();

            span_of(ledger.arena(), ptr, nbytes)
                .and_then(|(offset, length)| ledger.insert(offset, length).map(|()| offset))
        };

        let offset =
            released.inspect_err(|err| log::warn!("release({ptr:p}, {nbytes}) rejected: {err}"))?;

        log::debug!("released {nbytes} bytes at {ptr:p} (offset {offset:#x})");
        self.trace("release");

        Ok(())
    }

    /// First byte of the arena.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Number of bytes managed by the heap.
    #[inline]
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// The preemption hook the heap runs its critical sections with.
    #[inline]
    pub fn preemption(&self) -> &P {
        &self.preemption
    }

    /// Number of free bytes, possibly fragmented.
    pub fn free_bytes(&self) -> usize {
        self.enter().size()
    }

    /// Snapshot of the free regions in address order.
    pub fn regions(&self) -> Result<Vec<FreeRegion>> {
        self.enter().regions().collect()
    }

    /// Length of the largest free region, which bounds the largest request
    /// that can currently succeed.
    pub fn largest_region(&self) -> Result<usize> {
        self.enter()
            .regions()
            .try_fold(0, |largest, region: Result<FreeRegion>| -> Result<usize> {
                Ok(largest.max(region?.length))
            })
    }

    /// Snapshot of the heap usage.
    pub fn stats(&self) -> Result<HeapStats> {
        let ledger = self.enter();

        Ok(HeapStats {
            bound: self.bound,
            free_bytes: ledger.size(),
            regions: ledger.regions().collect::<Result<_>>()?,
        })
    }

    /// Walks the free list and verifies that it is sorted, that no regions
    /// overlap or touch, and that the free byte counter matches.
    pub fn check(&self) -> Result<()> {
        self.enter().check()
    }

    fn enter(&self) -> CriticalSection<'_, P, FreeList> {
        CriticalSection::enter(&self.preemption, &self.ledger)
    }

    fn trace(&self, op: &str) {
        if !self.trace_ledger || !log::log_enabled!(log::Level::Trace) {
            return;
        }

        match self.stats() {
            Ok(stats) => log::trace!("after {op}:\n{stats}"),
            Err(err) => log::trace!("after {op}: cannot walk free list: {err}"),
        }
    }
}

/// Turns the arguments of `release` into a span of the arena.
fn span_of(arena: &Arena, ptr: NonNull<u8>, nbytes: usize) -> Result<(usize, usize)> {
    if nbytes == 0 {
        return Err(HeapError::InvalidArgument {
            reason: "cannot release 0 bytes",
        });
    }

    let offset = arena.offset_of(ptr).ok_or(HeapError::InvalidArgument {
        reason: "pointer is outside of the arena",
    })?;

    if offset % GRANULE != 0 {
        return Err(HeapError::InvalidArgument {
            reason: "pointer is not aligned to the granularity unit",
        });
    }

    let length = round_mb(nbytes)
        .filter(|length| {
            offset
                .checked_add(*length)
                .is_some_and(|end| end <= arena.bound())
        })
        .ok_or(HeapError::InvalidArgument {
            reason: "block extends past the end of the arena",
        })?;

    Ok((offset, length))
}

impl<P: Preemption> fmt::Debug for MemHeap<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemHeap")
            .field("base", &self.base)
            .field("bound", &self.bound)
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

/// Layouts aligned to more than [`GRANULE`] cannot be served and get null.
unsafe impl<P: Preemption> GlobalAlloc for MemHeap<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > GRANULE {
            return ptr::null_mut();
        }

        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        // SAFETY: `GlobalAlloc::dealloc` requires the same contract.
        if let Err(err) = unsafe { self.release(ptr, layout.size()) } {
            log::error!("dealloc({ptr:p}, {layout:?}) failed: {err}");
        }
    }
}

/// Point in time view of a heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes managed by the heap.
    pub bound: usize,
    /// Free bytes.
    pub free_bytes: usize,
    /// Free regions in address order.
    pub regions: Vec<FreeRegion>,
}

impl HeapStats {
    /// Bytes currently handed out to callers.
    pub fn allocated_bytes(&self) -> usize {
        self.bound - self.free_bytes
    }

    pub fn largest_region(&self) -> usize {
        self.regions.iter().map(|r| r.length).max().unwrap_or(0)
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "heap: {} bytes, {} free in {} regions, {} allocated",
            self.bound,
            self.free_bytes,
            self.regions.len(),
            self.allocated_bytes(),
        )?;

        for region in &self.regions {
            writeln!(
                f,
                "  [0x{:08x} : {:>10} bytes : 0x{:08x}]",
                region.offset,
                region.length,
                region.end()
            )?;
        }

        Ok(())
    }
}
