//! # FFI Exports
//!
//! C ABI entry points that compiled programs call for every heap value they
//! allocate, share or drop. They all work on one process-wide [`Heap`].
//!
//! Link compiled programs against the static archive of this crate
//! (`librcalloc.a`). The generated code sees plain payload pointers, with
//! null standing for "no value" and for out-of-memory.
//!
//! None of these functions are thread safe. A program has exactly one mutator.

use std::{cell::UnsafeCell, ffi::c_void, ptr, ptr::NonNull};

use crate::heap::Heap;

/// The heap behind the C ABI.
struct GlobalHeap(UnsafeCell<Heap>);

// SAFETY: callers of the C ABI promise a single mutator thread.
unsafe impl Sync for GlobalHeap {}

static HEAP: GlobalHeap = GlobalHeap(UnsafeCell::new(Heap::new()));

/// **SAFETY**: no other reference to the global heap may be alive.
#[inline]
unsafe fn heap() -> &'static mut Heap {
    unsafe { &mut *HEAP.0.get() }
}

fn into_raw(result: Result<Option<NonNull<u8>>, crate::AllocError>) -> *mut c_void {
    match result {
        Ok(Some(ptr)) => ptr.as_ptr().cast(),
        Ok(None) => ptr::null_mut(),
        Err(err) => {
            log::debug!("allocation failed: {err}");
            ptr::null_mut()
        }
    }
}

/// Allocates `size` bytes with a reference count of one.
///
/// Returns null when `size` is zero or when no memory could be mapped.
///
/// # Safety
/// Must not be called concurrently with any other function of this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rcalloc(size: usize) -> *mut c_void {
    into_raw(unsafe { heap() }.acquire(size))
}

/// Allocates `size` bytes with a reference count of one, copies the first
/// `len` bytes from `ptr` and zeroes the rest.
///
/// Returns null if `ptr` is null or if the allocation fails.
///
/// # Safety
/// `ptr` must be null or readable for `min(len, size)` bytes. Must not be called
/// concurrently with any other function of this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rccopy(ptr: *const c_void, len: usize, size: usize) -> *mut c_void {
    into_raw(unsafe { heap().duplicate(ptr.cast(), len, size) })
}

/// Adds a reference. Null is ignored.
///
/// # Safety
/// `ptr` must be null or come from [`rcalloc`]/[`rccopy`]. Must not be called
/// concurrently with any other function of this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rcinc(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr.cast()) {
        unsafe { heap().retain(ptr) }
    }
}

/// Returns true if `ptr` is the only reference to its value. False for null.
///
/// # Safety
/// `ptr` must be null or come from [`rcalloc`]/[`rccopy`]. Must not be called
/// concurrently with any other function of this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn has_one_reference(ptr: *mut c_void) -> bool {
    match NonNull::new(ptr.cast()) {
        Some(ptr) => unsafe { heap().is_unique(ptr) },
        None => false,
    }
}

/// Drops a reference. The count never goes below zero. Null is ignored.
///
/// # Safety
/// `ptr` must be null or come from [`rcalloc`]/[`rccopy`]. Must not be called
/// concurrently with any other function of this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rcfree(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr.cast()) {
        unsafe { heap().release(ptr) }
    }
}

/// Drops a reference to a closure, releasing its captures when it dies.
/// Tagged immediates and null are ignored. Aborts the process on a double release.
///
/// # Safety
/// See [`Heap::release_closure`]. Must not be called concurrently with any
/// other function of this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rcfuncfree(ptr: *mut c_void) {
    unsafe { heap().release_closure(ptr.cast()) }
}
