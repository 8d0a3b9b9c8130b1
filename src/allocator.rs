use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{align::ALIGNMENT, heap::Heap};

/// The public face of the allocator. It owns the single threaded [`Heap`]
/// behind one global lock and exposes the four classic entry points over raw
/// pointers, plus [`std::alloc::GlobalAlloc`] so it can back a whole Rust
/// program:
///
/// ```no_run
/// use spanalloc::Spanalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Spanalloc = Spanalloc::new();
///
/// fn main() {
///     let mut numbers = vec![1, 2, 3];
///     numbers.push(4);
///     assert_eq!(numbers.len(), 4);
/// }
/// ```
///
/// Every pointer handed out is aligned to 16 bytes, and that is the whole
/// alignment story: layouts asking for more are refused with null.
///
/// The lock is the coarsest possible and makes no attempt at being clever;
/// one heap, one mutex. Finer grained schemes (a lock per span, or a heap
/// per thread keyed by thread id) would bolt on here without touching the
/// core, at the price of reallocation having to negotiate two locks.
pub struct Spanalloc {
    heap: Mutex<Heap>,
}

/// The heap is full of raw pointers, which makes it neither `Send` nor
/// `Sync` by default. All access goes through the mutex, so sharing the
/// wrapper is sound.
unsafe impl Sync for Spanalloc {}

impl Spanalloc {
    /// An empty allocator. No memory is mapped until the first allocation.
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// Allocates `size` bytes and returns the address of the first one, or
    /// null when `size` is zero or the OS refuses to provide pages.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match self.heap.lock() {
            Ok(mut heap) => to_raw(unsafe { heap.allocate(size) }),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Allocates room for `count` items of `size` bytes each, zeroed. Null
    /// on overflow of the product, like on any other failure.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        match self.heap.lock() {
            Ok(mut heap) => to_raw(unsafe { heap.allocate_zeroed(count, size) }),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Releases an allocation. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `address` must be null or an address previously returned by this
    /// allocator and not released since.
    pub unsafe fn deallocate(&self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        if let Ok(mut heap) = self.heap.lock() {
            heap.deallocate(address);
        }
    }

    /// Resizes an allocation to `size` bytes, moving it if it cannot grow
    /// where it is. Null `address` degenerates to [`Spanalloc::allocate`].
    /// On failure returns null and the original allocation stays valid.
    ///
    /// # Safety
    ///
    /// `address` must be null or an address previously returned by this
    /// allocator and not released since.
    pub unsafe fn reallocate(&self, address: *mut u8, size: usize) -> *mut u8 {
        let Some(address) = NonNull::new(address) else {
            return self.allocate(size);
        };

        match self.heap.lock() {
            Ok(mut heap) => to_raw(heap.reallocate(address, size)),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Whether `address` was handed out by this allocator and is still
    /// backed by one of its mappings. This is how the interposition layer
    /// tells foreign pointers apart before doing header math on them.
    pub fn owns(&self, address: *mut u8) -> bool {
        let Some(address) = NonNull::new(address) else {
            return false;
        };

        match self.heap.lock() {
            Ok(heap) => unsafe { heap.owns(address) },
            Err(_) => false,
        }
    }
}

impl Default for Spanalloc {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn to_raw(payload: crate::Pointer<u8>) -> *mut u8 {
    payload.map_or(ptr::null_mut(), NonNull::as_ptr)
}

unsafe impl GlobalAlloc for Spanalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.deallocate(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate_zeroed(layout.size(), 1)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.reallocate(ptr, new_size)
    }
}
