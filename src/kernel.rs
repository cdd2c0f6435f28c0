use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::{HeapError, Result},
    utils::align,
};

/// Virtual memory page size of the computer. This is usually 4096.
/// Zero until the first call to [`page_size`].
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Handle to the platform's memory syscalls.
pub(crate) struct Kernel;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The heap itself only needs one contiguous arena and has
/// nothing to do with the concrete APIs offered by each kernel.
trait PlatformMemory {
    /// Request a memory region of size `len`. It returns a Pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Computer's page size, queried once and cached.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { Kernel::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

/// Page aligned memory obtained from the platform, returned on drop.
///
/// This is where a hosted [`crate::MemHeap`] gets its arena from. A kernel
/// that already knows where its heap lives uses
/// [`crate::MemHeap::from_raw`] instead.
#[derive(Debug)]
pub struct MappedArena {
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value; no shared state.
unsafe impl Send for MappedArena {}
unsafe impl Sync for MappedArena {}

impl MappedArena {
    /// Maps at least `len` bytes of read/write memory. The length is rounded
    /// up to the page size.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(HeapError::InvalidArgument {
                reason: "cannot map an empty arena",
            });
        }

        let page = page_size();
        let len = align(len, page).ok_or(HeapError::MapFailed { len })?;

        let addr = unsafe { Kernel::request_memory(len) }.ok_or(HeapError::MapFailed { len })?;

        log::debug!("mapped {len} bytes for the arena at {addr:p}");

        Ok(Self { addr, len })
    }

    /// First byte of the mapping. Always page aligned.
    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.addr
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedArena {
    fn drop(&mut self) {
        unsafe { Kernel::return_memory(self.addr.as_ptr(), self.len) };
        log::debug!("unmapped {} bytes at {:p}", self.len, self.addr);
    }
}
