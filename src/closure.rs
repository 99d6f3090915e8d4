//! Releasing closures.
//!
//! A closure is an ordinary heap block whose payload is read as machine words:
//!
//! ```text
//! +----------------+----------+----------+-----+----------+
//! | descriptor ptr | arg 1    | arg 2    | ... | arg N    |
//! +----------------+----------+----------+-----+----------+
//!        |
//!        v
//! +----------------+
//! | arity (u32)    |   FunctionDescriptor, never owned by the heap
//! +----------------+
//! ```
//!
//! `N` is the arity of the descriptor. A partially applied closure stops at the
//! first zero slot. Every non-zero slot is itself released as a closure when the
//! closure dies, and so on down the tree.

use std::ptr::NonNull;

use crate::{block::BlockHeader, heap::Heap, kernel::PageSource};

/// Values with this bit set are immediates, not heap pointers.
pub const TAG_BIT: usize = 1;

/// Whether `value` is a tagged immediate that reference counting must ignore.
#[inline]
pub fn is_tagged(value: usize) -> bool {
    value & TAG_BIT != 0
}

/// Static description of a function, pointed to by the first word of every
/// closure. Generated code emits these as read-only data.
#[repr(C)]
#[derive(Debug)]
pub struct FunctionDescriptor {
    /// Number of arguments the function takes.
    pub arity: u32,
}

impl FunctionDescriptor {
    pub const fn new(arity: u32) -> Self {
        Self { arity }
    }
}

/// Pending work of [`Heap::release_closure`].
enum Step {
    /// Drop one reference to this value.
    Release(*mut u8),
    /// Every capture of this closure has been released, it can die now.
    Retire(NonNull<BlockHeader>),
}

impl<S: PageSource> Heap<S> {
    /// Drops a reference to the closure `ptr`.
    ///
    /// If that was the last reference, every captured argument is released the
    /// same way before the closure's own count goes to zero. Tagged immediates
    /// and null are ignored.
    ///
    /// Releasing a closure whose count is already zero means the program lost
    /// track of its references. The process is aborted on the spot.
    ///
    /// Reference cycles between closures are never collected.
    ///
    /// # Safety
    ///
    /// Unless tagged or null, `ptr` and everything reachable through its
    /// captures must be closures allocated by this heap.
    pub unsafe fn release_closure(&mut self, ptr: *mut u8) {
        let Some((ptr, header)) = (unsafe { self.drop_closure_reference(ptr) }) else {
            return;
        };

        // Nothing to walk when every capture is an immediate.
        if unsafe { captures(ptr) }.all(|arg| is_tagged(arg as usize)) {
            unsafe { retire(header) };
            return;
        }

        // Nesting depth is up to the program, so walk it with our own stack.
        let mut work = vec![Step::Retire(header)];
        unsafe { push_captures(&mut work, ptr) };

        while let Some(step) = work.pop() {
            match step {
                Step::Release(ptr) => {
                    if let Some((ptr, header)) = unsafe { self.drop_closure_reference(ptr) } {
                        work.push(Step::Retire(header));
                        unsafe { push_captures(&mut work, ptr) };
                    }
                }
                Step::Retire(header) => unsafe { retire(header) },
            }
        }
    }

    /// Drops one reference to `ptr` unless it is the last one.
    ///
    /// Returns the closure and its header when the caller holds the last
    /// reference and has to tear it down. Never allocates.
    ///
    /// **SAFETY**: same contract as [`Heap::release_closure`].
    unsafe fn drop_closure_reference(
        &mut self,
        ptr: *mut u8,
    ) -> Option<(NonNull<u8>, NonNull<BlockHeader>)> {
        if is_tagged(ptr as usize) {
            return None;
        }
        let ptr = NonNull::new(ptr)?;

        let mut header = unsafe { self.header(ptr) };
        let block = unsafe { header.as_mut() };

        match block.refcount {
            0 => double_release(ptr, header),
            1 => Some((ptr, header)),
            _ => {
                block.refcount -= 1;
                None
            }
        }
    }
}

/// The last reference is gone and so are the captures.
///
/// **SAFETY**: `header` must be a live block of the heap.
#[inline]
unsafe fn retire(mut header: NonNull<BlockHeader>) {
    unsafe { header.as_mut().refcount -= 1 };
}

/// Queues the captures of `ptr` so that they are popped first to last.
///
/// **SAFETY**: see [`captures`].
unsafe fn push_captures(work: &mut Vec<Step>, ptr: NonNull<u8>) {
    let mark = work.len();
    work.extend(unsafe { captures(ptr) }.map(Step::Release));
    work[mark..].reverse();
}

/// Non-zero captured arguments of the closure at `ptr`, up to its arity.
///
/// **SAFETY**: `ptr` must be a closure whose descriptor is valid and whose
/// block holds its arity in slots, or a zero slot before that.
unsafe fn captures(ptr: NonNull<u8>) -> impl Iterator<Item = *mut u8> {
    let words = ptr.cast::<usize>();

    let arity = unsafe {
        let descriptor = *words.as_ptr() as *const FunctionDescriptor;
        (*descriptor).arity as usize
    };

    (1..=arity)
        .map(move |slot| unsafe { *words.as_ptr().add(slot) })
        .take_while(|&word| word != 0)
        .map(|word| word as *mut u8)
}

/// The program released a dead closure. Going on would corrupt the heap further.
#[cold]
#[inline(never)]
fn double_release(ptr: NonNull<u8>, header: NonNull<BlockHeader>) -> ! {
    log::error!(
        "double release of closure {ptr:p} (header {header:p}): reference count is already 0"
    );
    eprintln!(
        "RCALLOC FATAL: closure {ptr:p} released with a reference count of 0 \
         (header {header:p}). Aborting."
    );
    std::process::abort()
}
