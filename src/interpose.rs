//! C ABI exports for symbol interposition. Built as a `cdylib` with the
//! `interpose` feature, the library can hijack the standard allocation
//! entry points of an unsuspecting binary:
//!
//! ```text
//! cargo build --release --features interpose
//! LD_PRELOAD=target/release/libspanalloc.so <your-binary>
//! ```
//!
//! There is one wrinkle: the process may hold pointers that did not come
//! from us, allocated before the preload took effect or by somebody calling
//! the real allocator directly. Handing those to our deallocation path would
//! read garbage headers, so `free` and `realloc` first check whether the
//! address falls inside one of our spans, and pass foreign pointers on to
//! the next definition of the symbol in resolution order.

use std::{
    ffi::c_void,
    mem, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Spanalloc;

/// The process wide allocator every exported symbol consults.
static ALLOCATOR: Spanalloc = Spanalloc::new();

static NEXT_FREE: AtomicUsize = AtomicUsize::new(0);
static NEXT_REALLOC: AtomicUsize = AtomicUsize::new(0);

/// Looks up the next definition of `name` after this library, lazily,
/// keeping the address in `cache` so the dance happens once per symbol.
///
/// # Safety
///
/// `F` must be the correct function pointer type for the symbol, and `name`
/// must be nul terminated.
unsafe fn next_symbol<F>(cache: &AtomicUsize, name: &'static [u8]) -> Option<F> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());

    let mut address = cache.load(Ordering::Relaxed);
    if address == 0 {
        address = libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast()) as usize;
        if address == 0 {
            return None;
        }
        cache.store(address, Ordering::Relaxed);
    }

    Some(mem::transmute_copy(&address))
}

#[no_mangle]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    ALLOCATOR.allocate(size).cast()
}

#[no_mangle]
pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    ALLOCATOR.allocate_zeroed(count, size).cast()
}

#[no_mangle]
pub unsafe extern "C" fn free(address: *mut c_void) {
    if address.is_null() {
        return;
    }

    if ALLOCATOR.owns(address.cast()) {
        ALLOCATOR.deallocate(address.cast());
        return;
    }

    // Not ours; whoever resolved the symbol before us gets it back. If
    // nobody did, leaking the pointer is the least bad option left.
    type Free = unsafe extern "C" fn(*mut c_void);
    if let Some(next_free) = next_symbol::<Free>(&NEXT_FREE, b"free\0") {
        next_free(address);
    }
}

#[no_mangle]
pub unsafe extern "C" fn realloc(address: *mut c_void, size: usize) -> *mut c_void {
    if !address.is_null() && !ALLOCATOR.owns(address.cast()) {
        type Realloc = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
        return match next_symbol::<Realloc>(&NEXT_REALLOC, b"realloc\0") {
            Some(next_realloc) => next_realloc(address, size),
            None => ptr::null_mut(),
        };
    }

    ALLOCATOR.reallocate(address.cast(), size).cast()
}
