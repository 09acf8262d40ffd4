use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use sptr::Strict;

use crate::polyfill::NonNullStrict;

/// A pointer to the base of the buffer managed by an allocator.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("buffer limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        // Checked at construction.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.addr().get() + self.extent) }
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        debug_assert!(self.contains_addr(block), "address outside of buffer");

        block.get() - self.ptr.addr().get()
    }

    /// Returns the address `offset` bytes past the base.
    #[inline]
    pub fn addr_at(self, offset: usize) -> NonZeroUsize {
        debug_assert!(offset < self.extent, "offset outside of buffer");

        // Cannot wrap or be zero: `offset` is below `extent` and the base is
        // nonzero.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.addr().get() + offset) }
    }

    /// Writes `link` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<BlockLink>()` bytes.
    /// - The memory at `addr` must not be handed out by the associated
    ///   allocator.
    #[inline]
    pub unsafe fn init_link_at(self, addr: NonZeroUsize, link: BlockLink) {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(
            link.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of buffer"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of buffer"
        );

        unsafe {
            self.with_addr(addr)
                .cast::<BlockLink>()
                .as_ptr()
                .write(link)
        };
    }

    /// Returns a shared reference to the `BlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// Same as [`BasePtr::link_mut`], except that other shared references to
    /// the link may be live.
    #[inline]
    pub unsafe fn link<'a>(self, link: NonZeroUsize) -> &'a BlockLink {
        debug_assert!(self.contains_addr(link));

        unsafe { self.ptr.with_addr(link).cast::<BlockLink>().as_ref() }
    }

    /// Returns a mutable reference to the `BlockLink` at `link`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `link` must be a properly aligned address for `BlockLink` values.
    /// - The memory at `link` must contain a properly initialized `BlockLink`.
    /// - The memory at `link` must be within the provenance of `self` and
    ///   must not be handed out by the associated allocator.
    /// - No other reference to the same link may be live.
    #[inline]
    pub unsafe fn link_mut<'a>(self, link: NonZeroUsize) -> &'a mut BlockLink {
        debug_assert!(self.contains_addr(link));

        let link = unsafe { self.ptr.with_addr(link).cast::<BlockLink>().as_mut() };

        debug_assert!(
            link.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of buffer"
        );
        debug_assert!(
            link.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of buffer"
        );

        link
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        self.ptr.with_addr(addr)
    }

    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));

        let ptr = self.ptr.as_ptr().with_addr(addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}

// Rather than using pointers, store only the addresses of the previous and
// next links.  This avoids accidentally violating stacked borrows; the
// links "point to" other blocks, but by forgoing actual pointers, no borrow
// is implied.
//
// NOTE: Using this method, any actual pointer to a block must be acquired
// via the allocator base pointer, and NOT by casting these addresses
// directly!

/// The header of a free block.
///
/// This type lives at offset 0 of every free block, threading the blocks of a
/// level into an intrusive doubly linked list. It is meaningless once the
/// block is handed out.
#[repr(C)]
#[derive(Debug)]
pub struct BlockLink {
    pub prev: Option<NonZeroUsize>,
    pub next: Option<NonZeroUsize>,
}
