use std::{marker::PhantomData, ptr::NonNull};

use crate::block::BlockHeader;

/// Non-null pointer to a block header.
pub(crate) type Link = Option<NonNull<BlockHeader>>;

/// The singly linked chain of every [`BlockHeader`] the heap owns, in address
/// order within a segment and in mapping order across segments.
///
/// ```text
/// +-----------------------------------+      +-----------------------------------+
/// | +-------+    +-------+    +-----+ |      | +-------+    +-------+            |
/// | | Block | -> | Block | -> | ... |-|----> | | Block | -> | Block | -> None    |
/// | +-------+    +-------+    +-----+ |      | +-------+    +-------+            |
/// +-----------------------------------+      +-----------------------------------+
///               Segment                                    Segment
/// ```
///
/// The links live inside the headers themselves, so the chain never allocates.
/// Because we are the allocator, every node is placed by the caller at an
/// address it already owns.
pub(crate) struct Chain {
    head: Link,
    tail: Link,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: Link,
    remaining: usize,
    marker: PhantomData<&'a BlockHeader>,
}

impl Chain {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `node` as the new tail of the chain.
    ///
    /// **SAFETY**: `node` must be a valid header that is not already linked.
    pub unsafe fn append(&mut self, mut node: NonNull<BlockHeader>) {
        unsafe {
            node.as_mut().next = None;

            match self.tail {
                Some(mut tail) => tail.as_mut().next = Some(node),
                None => self.head = Some(node),
            }
        }

        self.tail = Some(node);
        self.len += 1;
    }

    /// Records that `node` has been linked right after `at`, which is what
    /// [`BlockHeader::split`] does. Only the bookkeeping of the chain changes here.
    ///
    /// **SAFETY**: `at` must belong to this chain and `at.next` must already be `node`.
    pub unsafe fn linked_after(&mut self, at: NonNull<BlockHeader>, node: NonNull<BlockHeader>) {
        debug_assert_eq!(unsafe { at.as_ref().next }, Some(node));

        if self.tail == Some(at) {
            self.tail = Some(node);
        }
        self.len += 1;
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
        }
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> IntoIterator for &'a Chain {
    type Item = NonNull<BlockHeader>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
