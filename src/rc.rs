//! Reference counting over heap blocks.
//!
//! Nothing here frees memory explicitly. A block whose count reaches zero simply
//! becomes eligible for reuse the next time [`Heap::acquire`] walks the chain.

use std::ptr::NonNull;

use crate::{heap::Heap, kernel::PageSource};

impl<S: PageSource> Heap<S> {
    /// Adds a reference to the block behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap.
    pub unsafe fn retain(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let mut header = self.header(ptr);
            header.as_mut().refcount += 1;
        }
    }

    /// Whether `ptr` is the only reference to its block, in which case the
    /// caller may mutate it in place instead of copying it.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap.
    pub unsafe fn is_unique(&self, ptr: NonNull<u8>) -> bool {
        unsafe { self.refcount(ptr) == 1 }
    }

    /// Drops a reference to the block behind `ptr`. Releasing a block whose
    /// count is already zero does nothing.
    ///
    /// Closures must go through [`Heap::release_closure`] instead so that their
    /// captured values are released too.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let mut header = self.header(ptr);
            let block = header.as_mut();
            block.refcount = block.refcount.saturating_sub(1);
        }
    }

    /// Current reference count of the block behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap.
    pub unsafe fn refcount(&self, ptr: NonNull<u8>) -> usize {
        unsafe { self.header(ptr).as_ref().refcount }
    }
}
