//! Helper functions that don't particularly belong to any concrete module of the allocator.

/// The size of a machine word. Block headers and closure slots are laid out in words.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// Split points inside a segment are rounded up to [`WORD_SIZE`] so that the header of
/// the remainder block always lands on a word boundary. Returns `None` on overflow.
pub fn align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    debug_assert!(aligment.is_power_of_two());
    Some(to_be_aligned.checked_add(aligment - 1)? & !(aligment - 1))
}

/// Shorthand for [`align`] to the machine word.
#[inline]
pub fn align_word(to_be_aligned: usize) -> Option<usize> {
    align(to_be_aligned, WORD_SIZE)
}
