use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Virtual memory page size of the computer, cached after the first query.
/// This value should be a constant, but we can't know it at compile time.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Where the heap gets its segments from.
///
/// The production heap maps pages straight from the OS through [`Kernel`], but
/// tests swap in their own sources to observe or refuse segment requests.
///
/// # Safety
///
/// A `Some` returned from [`PageSource::map`] must point to at least `len` bytes
/// that are readable, writable, aligned to at least a machine word and not used
/// by anybody else for the rest of the process. The heap never gives them back.
pub unsafe trait PageSource {
    /// Requests a memory region of size `len`. Returns `None` if the
    /// underlying facility fails.
    fn map(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// The OS page-mapping facility.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kernel;

/// Abstraction over the platform syscalls. The allocator's top level view has
/// nothing to do with the concrete APIs offered by each kernel.
trait PlatformMemory {
    /// Requests a memory region of size `len`. It returns a pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

unsafe impl PageSource for Kernel {
    fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
        let addr = unsafe { Kernel::request_memory(len) };

        match addr {
            Some(addr) => log::trace!("mapped {len} bytes at {addr:p}"),
            None => log::debug!("page mapping of {len} bytes failed"),
        }

        addr
    }
}

/// Wrapper to calculate the computer's page size.
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

    use libc::{mmap, off_t, size_t};

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
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

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

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}
