use thiserror::Error;

/// Failures the allocator reports back to its caller.
///
/// A zero-sized request is not an error: [`crate::Heap::acquire`] answers it with `Ok(None)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS refused to map a new segment.
    #[error("failed to map a segment of {len} bytes")]
    MapFailed { len: usize },
    /// The request plus block header does not fit in `usize`.
    #[error("allocation request of {size} bytes overflows the address space")]
    SizeOverflow { size: usize },
}
