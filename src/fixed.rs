use core::{alloc::Layout, fmt, mem, ptr::NonNull};

use crate::{
    base::BlockLink,
    buddy::{BuddyAllocator, Config},
    AllocError, AllocInitError, BackingAllocator,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// A buddy allocator whose size and leaf size are fixed at compile time.
///
/// `SIZE` is the requested buffer size and need not be a power of two;
/// `LEAF` is the leaf size. Invalid parameters are rejected when the
/// constructor is instantiated. Behavior is identical to a
/// [`BuddyAllocator`] built from `Config::new(SIZE, LEAF)`.
pub struct FixedBuddy<const SIZE: usize, const LEAF: usize, A, E = A>
where
    A: BackingAllocator,
    E: BackingAllocator,
{
    inner: BuddyAllocator<A, E>,
}

impl<const SIZE: usize, const LEAF: usize, A, E> FixedBuddy<SIZE, LEAF, A, E>
where
    A: BackingAllocator,
    E: BackingAllocator,
{
    /// The number of levels, from the whole padded buffer down to one leaf.
    pub const NUM_LEVELS: usize = {
        let () = Self::VALID;
        (SIZE.next_power_of_two() / LEAF).trailing_zeros() as usize + 1
    };

    const VALID: () = {
        assert!(LEAF.is_power_of_two(), "leaf size must be a power of two");
        assert!(
            LEAF >= mem::size_of::<BlockLink>(),
            "leaf size must hold a free-list header"
        );
        assert!(SIZE >= LEAF, "leaf size must not exceed the buffer size");
        assert!(
            SIZE <= isize::MAX as usize / 2 + 1,
            "buffer size overflows"
        );
    };

    /// The configuration this allocator is built from.
    pub const CONFIG: Config = Config::new(SIZE, LEAF);

    /// Attempts to construct a new `FixedBuddy` whose buffer comes from
    /// `main` and whose metadata comes from `extra`.
    ///
    /// # Errors
    ///
    /// Returns an error if either backing allocator fails.
    pub fn try_new_in(abort_on_oom: bool, main: A, extra: E) -> Result<Self, AllocInitError> {
        let () = Self::VALID;

        let inner = BuddyAllocator::try_new_in(Self::CONFIG.abort_on_oom(abort_on_oom), main, extra)?;
        debug_assert_eq!(inner.num_levels(), Self::NUM_LEVELS);

        Ok(FixedBuddy { inner })
    }

    /// Returns a reference to the underlying engine.
    pub fn inner(&self) -> &BuddyAllocator<A, E> {
        &self.inner
    }

    /// Attempts to allocate a block of memory.
    ///
    /// See [`BuddyAllocator::allocate`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if no suitable block is free.
    #[inline]
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.inner.allocate(layout)
    }

    /// Deallocates the block referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator.
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.inner.deallocate(ptr) }
    }

    /// Returns the size of the block referenced by `ptr`.
    #[inline]
    pub fn allocated_size(&self, ptr: NonNull<u8>) -> usize {
        self.inner.allocated_size(ptr)
    }

    /// Returns the total size of all currently allocated blocks.
    #[inline]
    pub fn total_allocated(&self) -> usize {
        self.inner.total_allocated()
    }
}

#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
impl<const SIZE: usize, const LEAF: usize> FixedBuddy<SIZE, LEAF, Global> {
    /// Attempts to construct a new `FixedBuddy` backed by the global
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the global allocator fails.
    pub fn try_new() -> Result<Self, AllocInitError> {
        Self::try_new_in(false, Global, Global)
    }
}

impl<const SIZE: usize, const LEAF: usize, A, E> fmt::Debug for FixedBuddy<SIZE, LEAF, A, E>
where
    A: BackingAllocator,
    E: BackingAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBuddy")
            .field("inner", &self.inner)
            .finish()
    }
}
