use std::ptr::NonNull;

use crate::Pointer;

/// Seam between the page cache and whatever the target OS calls a memory
/// mapping. Only two things ever cross it: whole-page regions come in,
/// and the same regions go back at teardown.
trait PlatformSpecificMemory {
    /// Maps `length` writable bytes, a multiple of
    /// [`crate::size_class::PAGE_SIZE`]. `None` when the kernel refuses.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Unmaps a region previously produced by
    /// [`PlatformSpecificMemory::request_memory`], with the same length.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);
}

/// Zero sized type implementing [`PlatformSpecificMemory`] for each
/// supported target.
pub(crate) struct Platform;

/// Shorthand for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Shorthand for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Anonymous mapping: read-write, backed by no file, private
            // to this process.
            let address = libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );

            if address == libc::MAP_FAILED {
                return None;
            }

            Some(NonNull::new_unchecked(address).cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // The arguments always describe one whole mapping from
            // `request_memory`, so the failure modes `munmap` documents
            // are unreachable from here.
            let result = libc::munmap(address.cast().as_ptr(), length);
            debug_assert_eq!(result, 0);
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so mappings are mocked with the global allocator.
    //! A nice side effect: a mapping that never comes back at teardown
    //! shows up as a leak in Miri's report.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::{size_class::PAGE_SIZE, Pointer};

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, PAGE_SIZE).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }
    }
}
