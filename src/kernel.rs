use std::ptr::NonNull;

/// Bytes in the fixed initial heap reservation.
pub(crate) const HEAP_TOTAL_SIZE: usize = 4096;

/// Virtual memory page size of the computer. This is usually 4096.
/// This value should be a constant, but we can't do that since we
/// don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The heap engine, our top level view of this, has nothing
/// to do with the concrete implementation / API offered by the kernel, and
/// tests substitute in-memory sources to drive extension scenarios
/// deterministically.
pub(crate) trait MemorySource {
    /// The fixed reservation that seeds the heap, as a base address and a
    /// length in bytes. Handed out at most once per source; `None` means the
    /// heap cannot be set up at all.
    fn initial_region(&mut self) -> Option<(NonNull<u8>, usize)>;

    /// Moves the program break forward by `delta > 0` bytes and returns the
    /// *previous* break, i.e. the base of the granted range. `None` if the
    /// kernel refuses.
    unsafe fn brk_adjust(&mut self, delta: usize) -> Option<NonNull<u8>>;

    /// Requests an anonymous mapping of `len` bytes, a multiple of the page
    /// size. Returns the base or `None` if the underlying syscall fails.
    unsafe fn map_anon(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the mapping of size `len` starting at `addr` back to the
    /// kernel.
    unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize);

    /// Virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;
}

/// The real memory source: program break and anonymous mappings of the
/// running process.
pub(crate) struct Platform;

/// Wrapper to calculate the computer's page size.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = unix::page_size();
        }

        PAGE_SIZE
    }
}

#[cfg(unix)]
mod unix {
    use super::{MemorySource, Platform, HEAP_TOTAL_SIZE};

    use libc::{c_int, c_void, intptr_t, off_t, size_t};

    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// The fixed-address reservation backing the first heap span. Lives in
    /// the data segment, so the first break extension is usually not
    /// contiguous with it; the engine bridges that with a gap block.
    #[repr(align(8))]
    struct InitialHeap([u8; HEAP_TOTAL_SIZE]);

    static mut INITIAL_HEAP: InitialHeap = InitialHeap([0; HEAP_TOTAL_SIZE]);

    static INITIAL_TAKEN: AtomicBool = AtomicBool::new(false);

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }

    impl MemorySource for Platform {
        fn initial_region(&mut self) -> Option<(NonNull<u8>, usize)> {
            if INITIAL_TAKEN.swap(true, Ordering::AcqRel) {
                // The static reservation is single-claim. A second engine on
                // the real platform seeds from a fresh break span instead.
                unsafe {
                    let base = self.brk_adjust(HEAP_TOTAL_SIZE)?;
                    return Some((base, HEAP_TOTAL_SIZE));
                }
            }

            let base = unsafe { std::ptr::addr_of_mut!(INITIAL_HEAP) as *mut u8 };

            Some((NonNull::new(base)?, HEAP_TOTAL_SIZE))
        }

        unsafe fn brk_adjust(&mut self, delta: usize) -> Option<NonNull<u8>> {
            unsafe {
                let previous = libc::sbrk(delta as intptr_t);

                // sbrk reports failure as (void*)-1.
                if previous == usize::MAX as *mut c_void {
                    None
                } else {
                    Some(NonNull::new_unchecked(previous).cast::<u8>())
                }
            }
        }

        unsafe fn map_anon(&mut self, len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = libc::mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn unmap(&mut self, addr: NonNull<u8>, len: usize) {
            unsafe {
                libc::munmap(addr.as_ptr() as *mut c_void, len as size_t);
            }
        }

        fn page_size(&self) -> usize {
            super::page_size()
        }
    }
}
