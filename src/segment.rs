use std::ptr::NonNull;

use crate::{
    block::{BlockHeader, HEADER_SIZE},
    error::AllocError,
    kernel::PageSource,
};

/// Minimum size of a segment in bytes. Larger requests get a segment of their own.
pub const SEGMENT_SIZE: usize = 4096;

/// A raw region of memory obtained from a [`PageSource`]. Segments are never
/// returned: the OS reclaims them when the process exits.
///
/// A freshly mapped segment is one single free block spanning all of it:
///
/// ```text
/// +------------------------------------------------------+
/// | Header |               free payload                  |
/// +------------------------------------------------------+
/// ^ base                                          base + len
/// ```
///
/// The allocator then carves it into more blocks by splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    /// Start address returned by the page source.
    pub base: NonNull<u8>,
    /// Size of the mapping.
    pub len: usize,
}

impl Segment {
    /// Bytes to map so that a block of `request` bytes fits in a single segment,
    /// never less than `minimum`.
    pub fn len_for(request: usize, minimum: usize) -> Result<usize, AllocError> {
        let needed = request
            .checked_add(HEADER_SIZE)
            .ok_or(AllocError::SizeOverflow { size: request })?;

        Ok(needed.max(minimum))
    }

    /// Maps a new segment of `len` bytes and lays down its initial free block.
    pub fn map<S: PageSource>(
        source: &mut S,
        len: usize,
    ) -> Result<(Self, NonNull<BlockHeader>), AllocError> {
        debug_assert!(len > HEADER_SIZE);

        let base = source.map(len).ok_or(AllocError::MapFailed { len })?;
        let segment = Self { base, len };

        // SAFETY: PageSource guarantees `len` writable, word aligned bytes.
        let first = unsafe { BlockHeader::write(base, len - HEADER_SIZE, None) };

        Ok((segment, first))
    }
}
