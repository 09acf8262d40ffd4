//! Per-level lists of free blocks.
//!
//! The head array lives in metadata memory; the links themselves live at the
//! base of each free block (see [`BlockLink`]). All operations are O(1) and
//! lists are unordered. Pushes and pops happen at the head, so the most
//! recently freed block of a level is the first to be reused.

use core::{alloc::Layout, alloc::LayoutError, fmt, mem, num::NonZeroUsize, ptr::NonNull};

use crate::base::{BasePtr, BlockLink};

type Head = Option<NonZeroUsize>;

pub struct FreeLists {
    heads: NonNull<Head>,
    num_levels: usize,
}

impl FreeLists {
    /// Returns the layout of the head array for `num_levels` levels.
    pub fn layout(num_levels: usize) -> Result<Layout, LayoutError> {
        Layout::array::<Head>(num_levels)
    }

    /// Constructs a set of empty free lists.
    ///
    /// # Safety
    ///
    /// `heads` must be valid for reads and writes for
    /// `Self::layout(num_levels).size()` bytes, properly aligned, and not
    /// accessed by anything else while the lists exist.
    pub unsafe fn new(heads: NonNull<Head>, num_levels: usize) -> FreeLists {
        for level in 0..num_levels {
            unsafe { heads.as_ptr().add(level).write(None) };
        }

        FreeLists { heads, num_levels }
    }

    /// Returns the number of levels.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Returns the first block in the free list of `level`.
    #[inline]
    pub fn head(&self, level: usize) -> Option<NonZeroUsize> {
        assert!(level < self.num_levels);

        unsafe { self.heads.as_ptr().add(level).read() }
    }

    #[inline]
    fn set_head(&mut self, level: usize, head: Head) {
        assert!(level < self.num_levels);

        unsafe { self.heads.as_ptr().add(level).write(head) };
    }

    /// Pushes a block onto the head of the free list of `level`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `block` must be suitably aligned for `BlockLink`, and the memory at
    ///   `block` must be within the provenance of `base` and valid for reads
    ///   and writes for `size_of::<BlockLink>()` bytes.
    /// - `block` must be free and not already present in any free list.
    pub unsafe fn push(&mut self, base: BasePtr, level: usize, block: NonZeroUsize) {
        debug_assert_eq!(block.get() % mem::align_of::<BlockLink>(), 0);
        debug_assert_ne!(self.head(level), Some(block), "block pushed twice");

        let old_head = self.head(level);

        if let Some(old) = old_head {
            unsafe { base.link_mut(old).prev = Some(block) };
        }

        unsafe {
            base.init_link_at(
                block,
                BlockLink {
                    prev: None,
                    next: old_head,
                },
            )
        };

        self.set_head(level, Some(block));
    }

    /// Removes the specified block from the free list of `level`.
    ///
    /// # Safety
    ///
    /// `block` must be an element of the free list of `level`, and `base`
    /// must be the base pointer the list was built with.
    pub unsafe fn remove(&mut self, base: BasePtr, level: usize, block: NonZeroUsize) {
        let (prev, next) = unsafe {
            let removed = base.link_mut(block);
            (removed.prev.take(), removed.next.take())
        };

        match prev {
            // Link `prev` forward to `next`.
            Some(p) => unsafe { base.link_mut(p).next = next },

            // If there's no previous block, then `block` is the head of the
            // free list.
            None => {
                debug_assert_eq!(self.head(level), Some(block));
                self.set_head(level, next);
            }
        }

        if let Some(n) = next {
            // Link `next` back to `prev`.
            unsafe { base.link_mut(n).prev = prev };
        }
    }

    /// Removes and returns the head of the free list of `level`.
    ///
    /// # Safety
    ///
    /// `base` must be the base pointer the list was built with.
    pub unsafe fn pop(&mut self, base: BasePtr, level: usize) -> Option<NonZeroUsize> {
        let head = self.head(level)?;
        unsafe { self.remove(base, level, head) };
        Some(head)
    }

    /// Returns an iterator over the addresses in the free list of `level`,
    /// head first.
    ///
    /// # Safety
    ///
    /// `base` must be the base pointer the list was built with, and the list
    /// must not be modified while the iterator is live.
    pub unsafe fn iter(&self, base: BasePtr, level: usize) -> FreeIter {
        FreeIter {
            base,
            cur: self.head(level),
        }
    }
}

impl fmt::Debug for FreeLists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeLists")
            .field("num_levels", &self.num_levels)
            .finish()
    }
}

/// An iterator over the block addresses of one free list.
#[derive(Debug)]
pub struct FreeIter {
    base: BasePtr,
    cur: Option<NonZeroUsize>,
}

impl Iterator for FreeIter {
    type Item = NonZeroUsize;

    fn next(&mut self) -> Option<NonZeroUsize> {
        let cur = self.cur?;
        self.cur = unsafe { self.base.link(cur).next };
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;

    const BLOCK: usize = 64;

    /// A region of `n` blocks plus a two-level set of free lists over it.
    struct Harness {
        region: Vec<u64>,
        heads: Vec<Head>,
    }

    impl Harness {
        fn new(num_blocks: usize) -> Harness {
            Harness {
                region: vec![0; num_blocks * BLOCK / 8],
                heads: vec![None; 2],
            }
        }

        fn parts(&mut self) -> (BasePtr, FreeLists) {
            let extent = self.region.len() * 8;
            let base = BasePtr::new(NonNull::new(self.region.as_mut_ptr().cast()).unwrap(), extent);
            let lists = unsafe { FreeLists::new(NonNull::new(self.heads.as_mut_ptr()).unwrap(), 2) };
            (base, lists)
        }
    }

    fn block(base: BasePtr, i: usize) -> NonZeroUsize {
        base.addr_at(i * BLOCK)
    }

    fn collect(lists: &FreeLists, base: BasePtr, level: usize) -> Vec<NonZeroUsize> {
        unsafe { lists.iter(base, level).collect() }
    }

    #[test]
    fn push_is_lifo() {
        let mut h = Harness::new(4);
        let (base, mut lists) = h.parts();

        unsafe {
            for i in 0..4 {
                lists.push(base, 1, block(base, i));
            }
        }

        let expected: Vec<_> = (0..4).rev().map(|i| block(base, i)).collect();
        assert_eq!(collect(&lists, base, 1), expected);
        assert_eq!(lists.head(0), None);

        unsafe {
            assert_eq!(lists.pop(base, 1), Some(block(base, 3)));
            assert_eq!(lists.pop(base, 1), Some(block(base, 2)));
        }
        assert_eq!(lists.head(1), Some(block(base, 1)));
    }

    #[test]
    fn remove_head_middle_tail() {
        let mut h = Harness::new(5);
        let (base, mut lists) = h.parts();

        unsafe {
            for i in 0..5 {
                lists.push(base, 0, block(base, i));
            }

            // List is 4, 3, 2, 1, 0.
            lists.remove(base, 0, block(base, 2));
            lists.remove(base, 0, block(base, 4));
            lists.remove(base, 0, block(base, 0));
        }

        assert_eq!(collect(&lists, base, 0), [block(base, 3), block(base, 1)]);

        unsafe {
            lists.remove(base, 0, block(base, 1));
            lists.remove(base, 0, block(base, 3));
            assert_eq!(lists.pop(base, 0), None);
        }
        assert!(collect(&lists, base, 0).is_empty());
    }

    #[test]
    fn links_are_doubly_consistent() {
        let mut h = Harness::new(3);
        let (base, mut lists) = h.parts();

        unsafe {
            for i in 0..3 {
                lists.push(base, 1, block(base, i));
            }
            lists.remove(base, 1, block(base, 1));

            let head = base.link(block(base, 2));
            assert_eq!(head.prev, None);
            assert_eq!(head.next, Some(block(base, 0)));

            let tail = base.link(block(base, 0));
            assert_eq!(tail.prev, Some(block(base, 2)));
            assert_eq!(tail.next, None);
        }
    }
}
