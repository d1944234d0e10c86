use std::alloc::{GlobalAlloc, Layout};
use std::cell::UnsafeCell;
use std::hint;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::block::WORD;
use crate::heap::Heap;
use crate::kernel::Platform;


/// The public allocator.
///
/// Wraps the single-threaded heap engine and serializes every call with an
/// atomic flag, which is what lets it stand in as the process
/// [`GlobalAlloc`]:
///
/// ```no_run
/// use segalloc::SegAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: SegAlloc = SegAlloc::new();
///
/// fn main() {
///     let data = Box::new(7);
///     assert_eq!(*data, 7);
/// }
/// ```
///
/// The engine itself holds no locks and formats its heap lazily on the
/// first allocation.
///
/// Payloads are aligned to the machine word. Layouts asking for more than
/// that are refused with null rather than served misaligned.
pub struct SegAlloc {
    heap: UnsafeCell<Heap<Platform>>,
    busy: AtomicBool,
}

unsafe impl Send for SegAlloc {}
unsafe impl Sync for SegAlloc {}

impl SegAlloc {
    pub const fn new() -> Self {
        Self {
            heap: UnsafeCell::new(Heap::new(Platform)),
            busy: AtomicBool::new(false),
        }
    }

    /// Runs `f` with exclusive access to the engine.
    fn with<R>(&self, f: impl FnOnce(&mut Heap<Platform>) -> R) -> R {
        while self
            .busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }

        let result = f(unsafe { &mut *self.heap.get() });

        self.busy.store(false, Ordering::Release);

        result
    }

    /// Allocates memory for `layout`.
    ///
    /// Returns null on zero-size layouts, alignments above the machine
    /// word, and out-of-memory conditions.
    ///
    /// **SAFETY**: The returned pointer is valid until passed to
    /// [`SegAlloc::deallocate`] on the same allocator, and must be passed
    /// there at most once.
    pub unsafe fn allocate(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 || layout.align() > WORD {
            return ptr::null_mut();
        }

        self.with(|heap| unsafe {
            match heap.allocate(layout.size()) {
                Some(payload) => payload.as_ptr(),
                None => ptr::null_mut(),
            }
        })
    }

    /// Releases memory previously obtained from [`SegAlloc::allocate`].
    /// A null `ptr` is a no-op.
    ///
    /// **SAFETY**: `ptr` must come from this allocator and must not have
    /// been released before.
    pub unsafe fn deallocate(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }

        self.with(|heap| unsafe { heap.free(NonNull::new_unchecked(ptr)) });
    }
}

unsafe impl GlobalAlloc for SegAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { self.allocate(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.deallocate(ptr, layout) }
    }
}

impl Default for SegAlloc {
    fn default() -> Self {
        Self::new()
    }
}
