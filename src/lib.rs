//! # memheap
//!
//! A first-fit heap over a single contiguous arena, the kind a small kernel
//! keeps at the bottom of its memory subsystem when there is no other
//! allocator underneath it.
//!
//! ```text
//!   base                                                        base + bound
//!    +--------+-------+--------+--------------+-------+--------------------+
//!    | Block  | Free  | Block  |    Block     | Free  |        Free        |
//!    +--------+-------+--------+--------------+-------+--------------------+
//!              |  ^                            |  ^
//!     head ----+  +----------------------------+  |
//!                          next                    (merged on release)
//! ```
//!
//! The free regions form an address ordered linked list whose headers are
//! stored inside the free memory itself. Allocation takes the low end of the
//! first region that is large enough. Release puts the block back in address
//! order and merges it with the free regions on either side, so two free
//! regions are never adjacent.
//!
//! Live blocks have no header: whoever allocated a block passes its size
//! back when releasing it.
//!
//! ## Quick Start
//!
//! ```rust
//! use memheap::{HeapConfig, InterruptFlag, MemHeap};
//!
//! let heap = MemHeap::map(HeapConfig::new(4096), InterruptFlag::new()).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0, 100);
//!     heap.release(ptr, 100).unwrap();
//! }
//!
//! assert_eq!(heap.free_bytes(), heap.bound());
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   memheap
//!   ├── arena      - Bounds checked window over the arena bytes (internal)
//!   ├── block      - In-place free region header and the granularity unit
//!   ├── config     - HeapConfig
//!   ├── critical   - Preemption hook and critical section guards
//!   ├── error      - HeapError
//!   ├── freelist   - Address ordered free list (internal)
//!   ├── heap       - MemHeap, the allocator
//!   ├── kernel     - Platform memory (mmap / VirtualAlloc)
//!   └── utils      - Alignment helpers
//! ```
//!
//! ## Concurrency
//!
//! Every operation runs with preemption disabled through the [`Preemption`]
//! hook supplied by the surrounding system, and with the free list locked.
//! Nothing blocks besides that lock and every call finishes in time
//! proportional to the number of free regions.

mod arena;
mod block;
mod config;
mod critical;
mod error;
mod freelist;
mod heap;
mod kernel;
pub mod utils;

pub use block::GRANULE;
pub use config::HeapConfig;
pub use critical::{InterruptFlag, NoPreemption, PreemptGuard, Preemption};
pub use error::{HeapError, Result};
pub use freelist::FreeRegion;
pub use heap::{HeapStats, MemHeap};
pub use kernel::{MappedArena, page_size};
