use std::{fmt, ptr, ptr::NonNull};

use crate::{
    block::{BlockHeader, HEADER_SIZE},
    chain::{Chain, Link},
    error::AllocError,
    kernel::{self, Kernel, PageSource},
    segment::{SEGMENT_SIZE, Segment},
    utils::WORD_SIZE,
};

/// Tunables of a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Minimum number of bytes mapped per segment.
    pub segment_size: usize,
}

impl HeapConfig {
    /// Smallest segment that can hold a header and one word of payload.
    pub const MIN_SEGMENT_SIZE: usize = HEADER_SIZE + WORD_SIZE;

    /// Sizes below [`HeapConfig::MIN_SEGMENT_SIZE`] are raised to it.
    pub const fn new(segment_size: usize) -> Self {
        let segment_size = if segment_size < Self::MIN_SEGMENT_SIZE {
            Self::MIN_SEGMENT_SIZE
        } else {
            segment_size
        };

        Self { segment_size }
    }

    /// One OS page per segment.
    pub fn page_sized() -> Self {
        Self::new(kernel::page_size())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new(SEGMENT_SIZE)
    }
}

/// Snapshot of the heap returned by [`Heap::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub segments: usize,
    pub mapped_bytes: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    /// Payload bytes of blocks with a non-zero reference count.
    pub live_bytes: usize,
    /// Payload bytes of blocks with a zero reference count.
    pub free_bytes: usize,
}

/// One block of the chain, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub payload: NonNull<u8>,
    pub size: usize,
    pub refcount: usize,
}

/// A reference counting heap.
///
/// The heap is a chain of blocks spread across segments mapped from a
/// [`PageSource`]. Allocation walks the chain first-fit, splitting blocks that
/// are big enough, and only maps a new segment when nothing in the chain fits.
///
/// ```text
///            Segment                              Segment
/// +-----------------------------+      +-----------------------------+
/// | +------+    +------+        |      | +------+    +------+        |
/// | | rc 1 | -> | rc 0 | -------|----> | | rc 2 | -> | rc 0 | -> None |
/// | +------+    +------+        |      | +------+    +------+        |
/// +-----------------------------+      +-----------------------------+
/// ```
///
/// Blocks are never merged and segments are never unmapped. A block becomes
/// reusable as soon as its reference count drops to zero, see [`Heap::release`].
///
/// The heap is not thread safe. Every instance is meant to have exactly one mutator,
/// which is why the raw pointers inside make it neither `Send` nor `Sync`.
pub struct Heap<S = Kernel> {
    /// Every block of every segment.
    chain: Chain,
    /// Where new segments come from.
    source: S,
    config: HeapConfig,
    segments: usize,
    mapped_bytes: usize,
}

impl Heap<Kernel> {
    /// Creates an empty heap backed by the OS. Nothing is mapped until the
    /// first allocation.
    pub const fn new() -> Self {
        Self::with_config(HeapConfig::new(SEGMENT_SIZE), Kernel)
    }
}

impl Default for Heap<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PageSource> Heap<S> {
    pub const fn with_source(source: S) -> Self {
        Self::with_config(HeapConfig::new(SEGMENT_SIZE), source)
    }

    pub const fn with_config(config: HeapConfig, source: S) -> Self {
        Self {
            chain: Chain::new(),
            source,
            config,
            segments: 0,
            mapped_bytes: 0,
        }
    }

    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Allocates `size` bytes with a reference count of one.
    ///
    /// Returns `Ok(None)` for a zero-sized request. The content of the returned
    /// block is whatever it held before: fresh segments are zeroed by the OS but
    /// reused blocks are not cleared.
    pub fn acquire(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            return Ok(None);
        }

        // The first segment is always a minimum sized one, whatever the request.
        if self.chain.is_empty() {
            self.grow(self.config.segment_size)?;
        }

        let header = match self.find_free_block(size) {
            Some(header) => header,
            None => {
                let len = Segment::len_for(size, self.config.segment_size)?;
                self.grow(len)?
            }
        };

        // SAFETY: `header` is a free block of the chain with at least `size` bytes.
        Ok(Some(unsafe { self.claim(header, size) }))
    }

    /// Allocates `total` bytes and fills them from `source`.
    ///
    /// The first `initialized` bytes are copied, the remaining ones up to `total`
    /// are zeroed. A null `source` or a zero `total` yield `Ok(None)`.
    ///
    /// # Safety
    ///
    /// If not null, `source` must be valid for reads of `min(initialized, total)` bytes.
    pub unsafe fn duplicate(
        &mut self,
        source: *const u8,
        initialized: usize,
        total: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if source.is_null() {
            return Ok(None);
        }

        let Some(copy) = self.acquire(total)? else {
            return Ok(None);
        };

        let copied = initialized.min(total);

        unsafe {
            // `source` may be a dead block that first-fit just handed back out.
            ptr::copy(source, copy.as_ptr(), copied);
            ptr::write_bytes(copy.as_ptr().add(copied), 0, total - copied);
        }

        Ok(Some(copy))
    }

    /// Payload bytes of the block behind `ptr`. Can be larger than what was
    /// requested when the block was too small to split.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { self.header(ptr).as_ref().size }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            segments: self.segments,
            mapped_bytes: self.mapped_bytes,
            ..HeapStats::default()
        };

        for block in self.blocks() {
            stats.blocks += 1;
            if block.refcount == 0 {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
            } else {
                stats.live_bytes += block.size;
            }
        }

        stats
    }

    /// Every block in chain order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.chain.iter().map(|header| {
            let block = unsafe { header.as_ref() };
            BlockInfo {
                payload: BlockHeader::payload(header),
                size: block.size,
                refcount: block.refcount,
            }
        })
    }

    /// The header of the block behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap.
    pub(crate) unsafe fn header(&self, ptr: NonNull<u8>) -> NonNull<BlockHeader> {
        debug_assert!(
            ptr.as_ptr() as usize % WORD_SIZE == 0,
            "{ptr:p} is not a payload pointer"
        );

        let header = unsafe { BlockHeader::from_payload(ptr) };

        // Walking the chain is linear, so only the test suite pays for it.
        #[cfg(test)]
        assert!(
            self.chain.iter().any(|h| h == header),
            "{ptr:p} was not allocated by this heap"
        );

        header
    }

    /// First-fit: the first free block in chain order with room for `size` bytes.
    fn find_free_block(&self, size: usize) -> Link {
        self.chain.iter().find(|header| {
            let block = unsafe { header.as_ref() };
            block.is_free() && block.size >= size
        })
    }

    /// Maps a new segment of `len` bytes and links its block at the end of the chain.
    fn grow(&mut self, len: usize) -> Result<NonNull<BlockHeader>, AllocError> {
        let (segment, first) = Segment::map(&mut self.source, len)?;

        unsafe {
            self.chain.append(first);
        }
        self.segments += 1;
        self.mapped_bytes += segment.len;

        log::trace!(
            "new segment {:p} of {} bytes, {} segments mapped",
            segment.base,
            segment.len,
            self.segments
        );

        Ok(first)
    }

    /// Marks the free block `header` as used for `size` bytes, splitting off the
    /// rest if it is big enough to be useful.
    unsafe fn claim(&mut self, mut header: NonNull<BlockHeader>, size: usize) -> NonNull<u8> {
        unsafe {
            let splittable = BlockHeader::split_threshold(size)
                .is_some_and(|threshold| header.as_ref().size >= threshold);

            if splittable {
                let remainder = BlockHeader::split(header, size);
                self.chain.linked_after(header, remainder);
            }

            header.as_mut().refcount = 1;
        }

        BlockHeader::payload(header)
    }
}

impl<S> fmt::Debug for Heap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("segments", &self.segments)
            .field("mapped_bytes", &self.mapped_bytes)
            .field("blocks", &self.chain.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Maps from the OS until its budget runs out, then refuses.
    struct Budget {
        maps: usize,
        requested: Vec<usize>,
    }

    impl Budget {
        fn new(maps: usize) -> Self {
            Self {
                maps,
                requested: Vec::new(),
            }
        }
    }

    unsafe impl PageSource for Budget {
        fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
            self.requested.push(len);
            if self.maps == 0 {
                return None;
            }
            self.maps -= 1;
            Kernel.map(len)
        }
    }

    #[test]
    fn zero_size_is_no_value() {
        let mut heap = Heap::with_source(Budget::new(0));

        assert_eq!(Ok(None), heap.acquire(0));
        // Nothing was mapped for it.
        assert!(heap.source.requested.is_empty());
    }

    #[test]
    fn basic_alloc() {
        let mut heap = Heap::new();

        unsafe {
            let block = heap.acquire(4).unwrap().unwrap().cast::<u32>();
            block.as_ptr().write(23);

            assert_eq!(23, *block.as_ptr());
            assert_eq!(1, heap.refcount(block.cast()));
            assert!(heap.is_unique(block.cast()));
        }
    }

    #[test]
    fn payloads_are_word_aligned() {
        let mut heap = Heap::new();

        for size in [1, 3, 7, 10, 13, 24] {
            let ptr = heap.acquire(size).unwrap().unwrap();
            assert_eq!(0, ptr.as_ptr() as usize % WORD_SIZE, "request of {size} bytes");
        }
    }

    #[test]
    fn space_for_free_block_is_used() {
        let mut heap = Heap::new();

        unsafe {
            let first = heap.acquire(10).unwrap().unwrap();
            let _ = heap.acquire(8).unwrap();
            let _ = heap.acquire(8).unwrap();

            heap.release(first);

            let second = heap.acquire(10).unwrap().unwrap();
            assert_eq!(first, second);
            assert_eq!(1, heap.stats().segments);
        }
    }

    #[test]
    fn smaller_request_reuses_freed_block() {
        let mut heap = Heap::new();

        unsafe {
            let a = heap.acquire(10).unwrap().unwrap();
            heap.release(a);

            let b = heap.acquire(6).unwrap().unwrap();
            assert_eq!(a, b);
            // Too small to split again, so the block keeps its size.
            assert_eq!(10, heap.usable_size(b));
        }
    }

    #[test]
    fn split_remainder_is_reused_without_growing() {
        let mut heap = Heap::new();

        unsafe {
            let a = heap.acquire(100).unwrap().unwrap();
            heap.release(a);

            let b = heap.acquire(10).unwrap().unwrap();
            assert_eq!(a, b);
            assert_eq!(10, heap.usable_size(b));

            let c = heap.acquire(40).unwrap().unwrap();
            assert_eq!(b.as_ptr().add(16 + HEADER_SIZE), c.as_ptr());
            assert_eq!(100 - 16 - HEADER_SIZE, heap.usable_size(c));
            assert_eq!(1, heap.stats().segments);
        }
    }

    #[test]
    fn odd_sized_request_splits_a_freed_block() {
        let mut heap = Heap::new();

        unsafe {
            let a = heap.acquire(50).unwrap().unwrap();
            heap.release(a);

            // 50 >= 2 * 13 + header, so the block is split.
            let b = heap.acquire(13).unwrap().unwrap();
            assert_eq!(a, b);
            assert_eq!(13, heap.usable_size(b));

            let blocks: Vec<BlockInfo> = heap.blocks().collect();
            assert_eq!(3, blocks.len());
            assert_eq!(
                BlockInfo {
                    payload: b.add(16 + HEADER_SIZE),
                    size: 10,
                    refcount: 0
                },
                blocks[1]
            );

            // The remainder is reused in place.
            let c = heap.acquire(10).unwrap().unwrap();
            assert_eq!(blocks[1].payload, c);
            assert_eq!(1, heap.stats().segments);
        }
    }

    #[test]
    #[should_panic(expected = "was not allocated by this heap")]
    fn foreign_pointer_is_caught() {
        let mut heap = Heap::new();
        let _ = heap.acquire(8).unwrap().unwrap();

        let mut foreign = [0usize; 8];
        let ptr = NonNull::new(foreign.as_mut_ptr().wrapping_add(4)).unwrap().cast::<u8>();

        unsafe {
            heap.retain(ptr);
        }
    }

    #[test]
    fn unsplittable_block_is_handed_out_whole() {
        let mut heap = Heap::with_source(Budget::new(2));

        unsafe {
            // Leaves a tail block just under the split threshold of the next request.
            let tail = SEGMENT_SIZE - HEADER_SIZE - 64 - HEADER_SIZE;
            let _ = heap.acquire(64).unwrap().unwrap();
            let a = heap.acquire(tail / 2 + 1).unwrap().unwrap();

            assert_eq!(tail, heap.usable_size(a));
            assert_eq!(2, heap.stats().blocks);
        }
    }

    #[test]
    fn exhaustion_maps_another_segment() {
        let mut heap = Heap::with_source(Budget::new(2));

        let a = heap.acquire(3000).unwrap().unwrap();
        let b = heap.acquire(3000).unwrap().unwrap();

        assert_ne!(a, b);
        assert_eq!(vec![SEGMENT_SIZE, SEGMENT_SIZE], heap.source.requested);

        let stats = heap.stats();
        assert_eq!(2, stats.segments);
        assert_eq!(2 * SEGMENT_SIZE, stats.mapped_bytes);
        // Neither segment had room to split off a useful remainder.
        assert_eq!(2, stats.blocks);
        assert_eq!(2 * (SEGMENT_SIZE - HEADER_SIZE), stats.live_bytes);
    }

    #[test]
    fn large_request_gets_a_fitted_segment() {
        let mut heap = Heap::with_source(Budget::new(2));

        let big = heap.acquire(10_000).unwrap().unwrap();

        // The initial minimum segment is mapped first and cannot hold it.
        assert_eq!(vec![SEGMENT_SIZE, 10_000 + HEADER_SIZE], heap.source.requested);
        unsafe {
            assert_eq!(10_000, heap.usable_size(big));
        }
    }

    #[test]
    fn map_failure_is_reported() {
        let mut heap = Heap::with_source(Budget::new(0));
        assert_eq!(Err(AllocError::MapFailed { len: SEGMENT_SIZE }), heap.acquire(8));

        let mut heap = Heap::with_source(Budget::new(1));
        let _ = heap.acquire(8).unwrap().unwrap();
        assert_eq!(
            Err(AllocError::MapFailed {
                len: 5000 + HEADER_SIZE
            }),
            heap.acquire(5000)
        );

        // The heap keeps working from the segments it already has.
        assert!(heap.acquire(8).unwrap().is_some());
    }

    #[test]
    fn oversized_request_overflows() {
        let mut heap = Heap::new();

        assert_eq!(
            Err(AllocError::SizeOverflow { size: usize::MAX }),
            heap.acquire(usize::MAX)
        );
    }

    #[test]
    fn small_segment_size_is_clamped() {
        assert_eq!(HeapConfig::MIN_SEGMENT_SIZE, HeapConfig::new(1).segment_size);
        assert_eq!(SEGMENT_SIZE, HeapConfig::default().segment_size);
        assert_eq!(kernel::page_size(), HeapConfig::page_sized().segment_size);
    }

    #[test]
    fn custom_segment_size() {
        let mut heap = Heap::with_config(HeapConfig::new(1 << 16), Budget::new(1));

        let _ = heap.acquire(30_000).unwrap().unwrap();
        let _ = heap.acquire(30_000).unwrap().unwrap();

        assert_eq!(vec![1 << 16], heap.source.requested);
    }

    #[test]
    fn duplicate_copies_prefix_and_zeroes_tail() {
        let mut heap = Heap::new();
        let source = [1u8, 2, 3, 4, 5, 6, 7, 8];

        unsafe {
            let copy = heap.duplicate(source.as_ptr(), 3, 6).unwrap().unwrap();
            let bytes = std::slice::from_raw_parts(copy.as_ptr(), 6);

            assert_eq!(&[1, 2, 3, 0, 0, 0], bytes);
            assert_eq!(1, heap.refcount(copy));
        }
    }

    #[test]
    fn duplicate_of_reused_block_zeroes_stale_bytes() {
        let mut heap = Heap::new();

        unsafe {
            let old = heap.acquire(8).unwrap().unwrap();
            old.as_ptr().write_bytes(0xAA, 8);
            heap.release(old);

            let source = [9u8; 2];
            let copy = heap.duplicate(source.as_ptr(), 2, 8).unwrap().unwrap();

            assert_eq!(old, copy);
            assert_eq!(&[9, 9, 0, 0, 0, 0, 0, 0], std::slice::from_raw_parts(copy.as_ptr(), 8));
        }
    }

    #[test]
    fn duplicate_clamps_initialized_length() {
        let mut heap = Heap::new();
        let source = [7u8; 16];

        unsafe {
            let copy = heap.duplicate(source.as_ptr(), 16, 4).unwrap().unwrap();
            assert_eq!(&[7; 4], std::slice::from_raw_parts(copy.as_ptr(), 4));
            assert_eq!(4, heap.usable_size(copy));
        }
    }

    #[test]
    fn duplicate_of_nothing_is_nothing() {
        let mut heap = Heap::with_source(Budget::new(0));
        let source = [1u8; 4];

        unsafe {
            assert_eq!(Ok(None), heap.duplicate(ptr::null(), 4, 4));
            assert_eq!(Ok(None), heap.duplicate(source.as_ptr(), 0, 0));
            assert_eq!(
                Err(AllocError::MapFailed { len: SEGMENT_SIZE }),
                heap.duplicate(source.as_ptr(), 4, 4)
            );
        }
    }

    #[test]
    fn stats_track_live_and_free_blocks() {
        let mut heap = Heap::new();
        assert_eq!(HeapStats::default(), heap.stats());

        unsafe {
            let a = heap.acquire(16).unwrap().unwrap();
            let _b = heap.acquire(32).unwrap().unwrap();
            heap.release(a);
        }

        let stats = heap.stats();
        assert_eq!(1, stats.segments);
        assert_eq!(3, stats.blocks);
        assert_eq!(2, stats.free_blocks);
        assert_eq!(32, stats.live_bytes);
        assert_eq!(
            SEGMENT_SIZE,
            stats.live_bytes + stats.free_bytes + stats.blocks * HEADER_SIZE
        );
    }

    #[test]
    fn blocks_are_listed_in_chain_order() {
        let mut heap = Heap::new();

        let a = heap.acquire(8).unwrap().unwrap();
        let b = heap.acquire(24).unwrap().unwrap();

        let blocks: Vec<BlockInfo> = heap.blocks().collect();
        assert_eq!(3, blocks.len());
        assert_eq!(
            BlockInfo {
                payload: a,
                size: 8,
                refcount: 1
            },
            blocks[0]
        );
        assert_eq!(
            BlockInfo {
                payload: b,
                size: 24,
                refcount: 1
            },
            blocks[1]
        );
        assert_eq!(0, blocks[2].refcount);
    }
}
