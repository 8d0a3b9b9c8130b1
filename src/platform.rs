//! Page provider. The allocator only ever asks the OS for runs of anonymous
//! read-write pages and gives them back wholesale; everything below that
//! (mmap, VirtualAlloc, whatever) is hidden behind [`PageProvider`].

use std::ptr::NonNull;

use crate::Pointer;

/// The three operations the allocator needs from the underlying system.
trait PageProvider {
    /// Requests a mapping where `length` bytes can be read and written. The
    /// returned address is page aligned and the memory is zeroed.
    unsafe fn map(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the system. Called
    /// with exactly the address and length of a previous [`Self::map`].
    unsafe fn unmap(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PageProvider`] for the current target.
struct Os;

/// Page size cache. The value never changes while the process runs, so ask
/// the system once and keep it.
static mut PAGE_SIZE: usize = 0;

#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Os::page_size();
        }

        PAGE_SIZE
    }
}

/// Convenience wrapper over [`PageProvider::map`].
#[inline]
pub(crate) unsafe fn map(length: usize) -> Pointer<u8> {
    debug_assert!(length % page_size() == 0);
    Os::map(length)
}

/// Convenience wrapper over [`PageProvider::unmap`].
#[inline]
pub(crate) unsafe fn unmap(address: NonNull<u8>, length: usize) {
    Os::unmap(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Os, PageProvider};
    use crate::Pointer;

    impl PageProvider for Os {
        unsafe fn map(length: usize) -> Pointer<u8> {
            // Private anonymous pages, read-write, not backed by any file.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                return None;
            }

            Some(NonNull::new_unchecked(address).cast())
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // The region stays mapped. Nothing sensible to do about it,
                // and the bookkeeping already forgot the span, so leak it.
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Os, PageProvider};
    use crate::Pointer;

    impl PageProvider for Os {
        unsafe fn map(length: usize) -> Pointer<u8> {
            // Reserve and commit in one call; the pages are zeroed by the
            // kernel just like the unix mapping.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let address = Memory::VirtualAlloc(None, length, flags, Memory::PAGE_READWRITE);

            NonNull::new(address.cast())
        }

        unsafe fn unmap(address: NonNull<u8>, _length: usize) {
            // Length zero with MEM_RELEASE frees the entire original
            // reservation, which is always a whole span here.
            if !Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE).as_bool() {
                // Same story as munmap failing: leak the region.
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so system calls are off the table. Mock the page
    //! provider on top of the global allocator instead; as a bonus, Miri's
    //! leak checker then catches spans this allocator forgets to unmap.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Os, PageProvider};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PageProvider for Os {
        unsafe fn map(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
