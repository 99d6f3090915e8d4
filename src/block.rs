use std::{mem, ptr::NonNull};

use crate::{
    chain::Link,
    utils::{WORD_SIZE, align_word},
};

/// Header size of a block. Every payload pointer handed out by the heap sits
/// exactly this many bytes after its header.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// This is the structure of a block. The fields of the header are its metadata,
/// content is placed right after it.
///
/// ```text
/// +---------------------+ <------+
/// |        next         |        |
/// +---------------------+        |
/// |        size         |        | -> Header
/// +---------------------+        |
/// |      refcount       |        |
/// +---------------------+ <------+ <-- payload pointer
/// |       Content       |        |
/// |         ...         |        | -> Addressable content (`size` bytes)
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// The layout is `#[repr(C)]` because generated code only ever sees payload
/// pointers and the header has to be recoverable from them by a fixed back-step.
/// That back-step lives in [`BlockHeader::from_payload`] and nowhere else.
///
/// `refcount == 0` means the block is free and first-fit may reuse it.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct BlockHeader {
    /// Next block in the heap chain. The chain spans every segment.
    pub next: Link,
    /// Usable payload bytes, header excluded.
    pub size: usize,
    /// Number of live references. Zero means free.
    pub refcount: usize,
}

impl BlockHeader {
    /// A detached free header of `size` payload bytes.
    #[cfg(test)]
    pub const fn free(size: usize) -> Self {
        Self {
            next: None,
            size,
            refcount: 0,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.refcount == 0
    }

    /// Writes a fresh free header at `addr`.
    ///
    /// **SAFETY**: `addr` must be word aligned and valid for [`HEADER_SIZE`] bytes of writes.
    pub unsafe fn write(addr: NonNull<u8>, size: usize, next: Link) -> NonNull<BlockHeader> {
        let header = addr.cast::<BlockHeader>();

        unsafe {
            header.as_ptr().write(BlockHeader {
                next,
                size,
                refcount: 0,
            });
        }

        header
    }

    /// First byte of the block content.
    #[inline]
    pub fn payload(header: NonNull<BlockHeader>) -> NonNull<u8> {
        unsafe { header.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Recovers the header that owns `payload`.
    ///
    /// **SAFETY**: `payload` must have been returned by [`BlockHeader::payload`] on a
    /// header that is still part of a mapped segment.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        unsafe { payload.sub(HEADER_SIZE).cast::<BlockHeader>() }
    }

    /// Smallest free block that is worth splitting for a request of `size` bytes.
    ///
    /// The block needs room for twice the request plus a header, otherwise the
    /// leftover would be too small to ever be useful. On top of that the
    /// remainder header, placed at the next word boundary, must still leave at
    /// least one word of payload.
    pub fn split_threshold(size: usize) -> Option<usize> {
        let doubled = size.checked_mul(2)?.checked_add(HEADER_SIZE)?;
        let aligned = align_word(size)?.checked_add(HEADER_SIZE + WORD_SIZE)?;

        Some(doubled.max(aligned))
    }

    /// Splits `header` so that it keeps exactly `size` payload bytes. The leftover
    /// becomes a new free block linked right after it, and is returned.
    ///
    /// The remainder header is placed at the next word boundary after the first
    /// `size` bytes, so the padding between them belongs to nobody.
    ///
    /// **SAFETY**: `header` must be a valid block with `size` at least
    /// [`BlockHeader::split_threshold`]`(size)` bytes.
    pub unsafe fn split(mut header: NonNull<BlockHeader>, size: usize) -> NonNull<BlockHeader> {
        unsafe {
            let block = header.as_mut();
            // Cannot overflow: split_threshold already checked these sums.
            let used = size.next_multiple_of(WORD_SIZE);
            debug_assert!(block.size >= used + HEADER_SIZE + WORD_SIZE);

            let remainder_addr = Self::payload(header).add(used);
            let remainder_size = block.size - used - HEADER_SIZE;
            let remainder = Self::write(remainder_addr, remainder_size, block.next);

            block.next = Some(remainder);
            block.size = size;

            log::trace!(
                "split block {header:p}: kept {size} bytes, remainder {remainder:p} of {} bytes",
                remainder.as_ref().size
            );

            remainder
        }
    }
}
