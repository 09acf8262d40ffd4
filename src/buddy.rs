//! A binary-buddy allocator over a single power-of-two buffer.
//!
//! The buffer is divided into leaves of `leaf_size` bytes. A block at level
//! `L` spans `buffer_size >> L` bytes, so level 0 is the whole buffer and the
//! last level is a single leaf. Two packed side tables indexed by leaf record
//! the level of the block covering each leaf and whether that block is handed
//! out; free blocks are threaded into per-level lists through their first
//! bytes.
//!
//! A buffer whose requested size is not a power of two is rounded up, and the
//! leading bytes beyond the requested size are cordoned off as permanently
//! allocated.

use core::{
    alloc::{Layout, LayoutError},
    cmp, fmt, mem,
    num::NonZeroUsize,
    ptr::NonNull,
};

use crate::{
    base::{BasePtr, BlockLink},
    free_list::FreeLists,
    packed::PackedArray,
    polyfill::*,
    AllocError, AllocInitError, BackingAllocator, ConfigError,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Declares wrappers which allow a `BuddyAllocator` to be shared through a
/// cell or lock, and implements [`BackingAllocator`] for them.
macro_rules! declare_wrappers {
    ($($(#[$attr:meta])* $wrapper:ident uses $typename:ident via $method:path)*) => {
        $(
            #[doc = concat!("A `BuddyAllocator` wrapped by a `", stringify!($typename), "`.")]
            ///
            /// This type implements [`BackingAllocator`], so it can back another
            /// allocator, including another `BuddyAllocator`.
            $(#[$attr])*
            pub struct $wrapper<A: BackingAllocator, E: BackingAllocator = A> {
                inner: $typename<BuddyAllocator<A, E>>,
            }

            $(#[$attr])*
            impl<A: BackingAllocator, E: BackingAllocator> $wrapper<A, E> {
                /// Wraps `allocator`.
                pub fn new(allocator: BuddyAllocator<A, E>) -> Self {
                    $wrapper {
                        inner: $typename::new(allocator),
                    }
                }

                /// Returns a reference to the inner wrapper.
                pub fn inner(&self) -> &$typename<BuddyAllocator<A, E>> {
                    &self.inner
                }

                /// Unwraps the allocator.
                pub fn into_inner(self) -> $typename<BuddyAllocator<A, E>> {
                    self.inner
                }
            }

            $(#[$attr])*
            impl<A: BackingAllocator, E: BackingAllocator> fmt::Debug for $wrapper<A, E> {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($wrapper))
                        .field("inner", &self.inner)
                        .finish()
                }
            }

            // SAFETY:
            //
            // - Allocated blocks point into the buffer owned by the wrapped
            //   `BuddyAllocator` and are valid until it is dropped.
            // - Moving the wrapper does not invalidate allocated memory because
            //   that memory is behind a pointer.
            // - Any pointer to a currently allocated block is safe to deallocate,
            //   and the engine recovers the block size from its own tables.
            $(#[$attr])*
            unsafe impl<A: BackingAllocator, E: BackingAllocator> BackingAllocator
                for $wrapper<A, E>
            {
                fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
                    $method(&self.inner).allocate(layout)
                }

                unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
                    let _ = layout;

                    unsafe { $method(&self.inner).deallocate(ptr) }
                }
            }
        )*
    };
}

declare_wrappers! {
    RefCellBuddyAllocator uses RefCell via RefCell::borrow_mut
}

#[cfg(feature = "std")]
declare_wrappers! {
    #[cfg_attr(docs_rs, doc(cfg(feature = "std")))]
    MutexBuddyAllocator uses Mutex via lock_ignoring_poison
}

use core::cell::RefCell;

#[cfg(feature = "std")]
use std::sync::{Mutex, MutexGuard, PoisonError};

// Poisoning is ignored: the engine never panics halfway through an update.
#[cfg(feature = "std")]
fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Construction parameters for a [`BuddyAllocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    size: usize,
    leaf_size: usize,
    abort_on_oom: bool,
}

impl Config {
    /// Creates a configuration for an allocator managing `size` bytes in
    /// blocks no smaller than `leaf_size` bytes.
    ///
    /// `size` need not be a power of two. `leaf_size` must be a power of two
    /// no smaller than the free-list header (two words).
    pub const fn new(size: usize, leaf_size: usize) -> Config {
        Config {
            size,
            leaf_size,
            abort_on_oom: false,
        }
    }

    /// Sets whether exhaustion at allocation time terminates the process
    /// instead of returning an error.
    pub const fn abort_on_oom(self, abort_on_oom: bool) -> Config {
        Config {
            abort_on_oom,
            ..self
        }
    }

    /// Returns the requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the requested leaf size in bytes.
    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Validates the configuration and computes the resulting geometry.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first parameter that cannot be
    /// satisfied.
    pub fn geometry(&self) -> Result<Geometry, ConfigError> {
        let Config {
            size, leaf_size, ..
        } = *self;

        if size == 0 || leaf_size == 0 {
            return Err(ConfigError::ZeroSize);
        }

        if !leaf_size.is_power_of_two() {
            return Err(ConfigError::LeafNotPowerOfTwo);
        }

        if leaf_size < mem::size_of::<BlockLink>() {
            return Err(ConfigError::LeafTooSmall);
        }

        if leaf_size > size {
            return Err(ConfigError::LeafLargerThanBuffer);
        }

        let buffer_size = size.clip_pow2().ok_or(ConfigError::SizeOverflow)?;

        // The buffer must also be describable by a `Layout`.
        Layout::from_size_align(buffer_size, leaf_size).map_err(|_| ConfigError::SizeOverflow)?;

        let num_levels = (buffer_size / leaf_size).log2() as usize + 1;
        if num_levels > u64::BITS as usize {
            return Err(ConfigError::TooManyLevels);
        }

        // Only whole leaves are cordoned off; a partial leaf stays usable.
        let unavailable = (buffer_size - size) / leaf_size * leaf_size;

        Ok(Geometry {
            buffer_size,
            leaf_size,
            num_levels,
            unavailable,
        })
    }
}

/// The validated, immutable shape of a buddy allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    buffer_size: usize,
    leaf_size: usize,
    num_levels: usize,
    unavailable: usize,
}

impl Geometry {
    /// Returns the size of the padded buffer. Always a power of two.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns the size of the smallest block.
    #[inline]
    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Returns the number of levels.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Returns the index of the level whose blocks are single leaves.
    #[inline]
    pub fn last_level(&self) -> usize {
        self.num_levels - 1
    }

    /// Returns the number of leaves in the padded buffer.
    #[inline]
    pub fn num_leaves(&self) -> usize {
        self.buffer_size / self.leaf_size
    }

    /// Returns the size of the cordoned-off prefix.
    #[inline]
    pub fn unavailable(&self) -> usize {
        self.unavailable
    }

    /// Returns the number of bytes that can be handed out.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer_size - self.unavailable
    }

    /// Returns the size of a block at `level`.
    #[inline]
    pub fn block_size(&self, level: usize) -> usize {
        debug_assert!(level < self.num_levels);

        self.buffer_size >> level
    }

    /// Returns the number of leaves covered by a block at `level`.
    #[inline]
    pub fn leaves_per_block(&self, level: usize) -> usize {
        debug_assert!(level < self.num_levels);

        1 << (self.last_level() - level)
    }

    /// Returns the level of the smallest block that holds `size` bytes, or
    /// `None` if no block is large enough.
    ///
    /// Sizes below the leaf size, including zero, map to the last level.
    pub fn level_for(&self, size: usize) -> Option<usize> {
        let block_size = cmp::max(size, self.leaf_size).clip_pow2()?;
        if block_size > self.buffer_size {
            return None;
        }

        Some((self.buffer_size.log2() - block_size.log2()) as usize)
    }

    /// Returns the width in bits of an entry in the leaf-level table.
    #[inline]
    pub fn level_bits(&self) -> u32 {
        self.num_levels.bits_to_index()
    }

    fn buffer_layout(&self) -> Layout {
        // Checked in `Config::geometry`.
        unsafe { Layout::from_size_align_unchecked(self.buffer_size, self.leaf_size) }
    }

    fn metadata_layout(&self) -> Result<MetadataLayout, LayoutError> {
        let heads = FreeLists::layout(self.num_levels)?;
        let levels = PackedArray::map_layout(self.level_bits(), self.num_leaves())?;
        let allocated = PackedArray::map_layout(1, self.num_leaves())?;

        let (with_levels, levels_ofs) = heads.extend(levels)?;
        let (full, allocated_ofs) = with_levels.extend(allocated)?;

        Ok(MetadataLayout {
            layout: full.pad_to_align(),
            levels_ofs,
            allocated_ofs,
        })
    }
}

/// The metadata region: free-list heads, then the level table, then the
/// allocated table.
#[derive(Copy, Clone, Debug)]
struct MetadataLayout {
    layout: Layout,
    levels_ofs: usize,
    allocated_ofs: usize,
}

/// The state of a block reported by [`BuddyAllocator::blocks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// The block is in a free list.
    Free,
    /// The block is handed out.
    Allocated,
    /// The block lies in the cordoned-off prefix and is never handed out.
    Unavailable,
}

/// A block of the buffer, identified by its first leaf and its level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Index of the first leaf covered by the block.
    pub leaf: usize,
    /// Level of the block.
    pub level: usize,
    /// Size of the block in bytes.
    pub size: usize,
    /// Whether the block is free, allocated or unavailable.
    pub state: BlockState,
}

/// A buddy allocator.
///
/// The buffer is allocated from `A` and the metadata from `E`; both are
/// released when the allocator is dropped.
pub struct BuddyAllocator<A: BackingAllocator, E: BackingAllocator = A> {
    base: BasePtr,
    metadata: NonNull<u8>,
    metadata_layout: Layout,
    geometry: Geometry,
    abort_on_oom: bool,
    free_lists: FreeLists,
    levels: PackedArray,
    allocated: PackedArray,
    total_allocated: usize,
    main: A,
    extra: E,
}

// SAFETY: the allocator exclusively owns its buffer and metadata; the raw
// pointers it holds are never shared with another allocator instance.
unsafe impl<A, E> Send for BuddyAllocator<A, E>
where
    A: BackingAllocator + Send,
    E: BackingAllocator + Send,
{
}

#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
impl BuddyAllocator<Global> {
    /// Attempts to construct a new `BuddyAllocator` backed by the global
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or if the global
    /// allocator fails to provide the buffer or the metadata.
    pub fn try_new(config: Config) -> Result<BuddyAllocator<Global>, AllocInitError> {
        Self::try_new_in(config, Global, Global)
    }

    /// Constructs a new `BuddyAllocator` backed by the global allocator.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. If allocation fails, this
    /// constructor invokes [`handle_alloc_error`].
    ///
    /// [`handle_alloc_error`]: alloc::alloc::handle_alloc_error
    pub fn new(config: Config) -> BuddyAllocator<Global> {
        match Self::try_new(config) {
            Ok(a) => a,
            Err(AllocInitError::AllocFailed(layout)) => alloc::alloc::handle_alloc_error(layout),
            Err(AllocInitError::InvalidConfig(e)) => {
                panic!("invalid buddy allocator configuration: {e}")
            }
        }
    }
}

impl<A: BackingAllocator, E: BackingAllocator> BuddyAllocator<A, E> {
    /// Attempts to construct a new `BuddyAllocator` whose buffer comes from
    /// `main` and whose metadata comes from `extra`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or if either backing
    /// allocator fails. Nothing is leaked on failure.
    pub fn try_new_in(config: Config, main: A, extra: E) -> Result<Self, AllocInitError> {
        let geometry = config.geometry()?;
        let buffer_layout = geometry.buffer_layout();
        let meta = geometry
            .metadata_layout()
            .map_err(|_| ConfigError::SizeOverflow)?;

        let buffer = main
            .allocate(buffer_layout)
            .map_err(|_| AllocInitError::AllocFailed(buffer_layout))?
            .cast::<u8>();

        let metadata = match extra.allocate(meta.layout) {
            Ok(m) => m.cast::<u8>(),
            Err(_) => {
                unsafe { main.deallocate(buffer, buffer_layout) };
                return Err(AllocInitError::AllocFailed(meta.layout));
            }
        };

        let parts = unsafe { BuddyParts::new(buffer, metadata, geometry, meta) };
        let allocator = parts.with_allocators(config.abort_on_oom, main, extra);

        log::debug!(
            "buddy allocator: {} bytes ({} usable), {}-byte leaves, {} levels, {} leaves",
            geometry.buffer_size,
            geometry.capacity(),
            geometry.leaf_size,
            geometry.num_levels,
            geometry.num_leaves(),
        );

        Ok(allocator)
    }

    /// Returns the geometry of the allocator.
    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Returns the size of the padded buffer.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.geometry.buffer_size
    }

    /// Returns the size of the smallest block.
    #[inline]
    pub fn leaf_size(&self) -> usize {
        self.geometry.leaf_size
    }

    /// Returns the number of levels.
    #[inline]
    pub fn num_levels(&self) -> usize {
        self.geometry.num_levels
    }

    /// Returns the size of the cordoned-off prefix.
    #[inline]
    pub fn unavailable(&self) -> usize {
        self.geometry.unavailable
    }

    /// Returns the number of bytes that can be handed out.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.geometry.capacity()
    }

    /// Returns a pointer to the padded buffer, including the unavailable
    /// prefix.
    ///
    /// It is undefined behavior to dereference the returned pointer or upgrade
    /// it to a reference while the allocator is live.
    pub fn region(&self) -> NonNull<[u8]> {
        self.base
            .with_addr_and_size(self.base.addr(), self.geometry.buffer_size)
    }

    /// Returns the total size of all currently allocated blocks.
    #[inline]
    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    /// Returns the number of bytes in free blocks.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.capacity() - self.total_allocated
    }

    #[inline]
    fn leaf_of(&self, block: NonZeroUsize) -> usize {
        self.base.offset_to(block) / self.geometry.leaf_size
    }

    #[inline]
    fn addr_of(&self, leaf: usize) -> NonZeroUsize {
        self.base.addr_at(leaf * self.geometry.leaf_size)
    }

    /// Attempts to allocate a block of memory.
    ///
    /// On success, returns a [`NonNull<[u8]>`] spanning the whole block, which
    /// is the smallest power of two no smaller than both `layout.size()` and
    /// the leaf size. Every block is aligned to the leaf size.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `layout.align()` exceeds the leaf size, or if no free
    /// block is large enough. In the latter case, if the allocator was
    /// configured to abort on exhaustion, this method does not return.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > self.geometry.leaf_size {
            return Err(AllocError);
        }

        let target_level = match self.geometry.level_for(layout.size()) {
            Some(l) => l,
            None => return self.exhausted(layout),
        };

        // Find the smallest free block that is large enough.
        let base = self.base;
        let found = (0..=target_level)
            .rev()
            .find_map(|level| unsafe { self.free_lists.pop(base, level) }.map(|b| (b, level)));

        let (block, init_level) = match found {
            Some(f) => f,
            None => return self.exhausted(layout),
        };

        let leaf = self.leaf_of(block);
        debug_assert_eq!(
            self.levels.get(leaf),
            init_level as u64,
            "free list entry at the wrong level"
        );
        debug_assert_eq!(self.allocated.get(leaf), 0, "allocated block in free list");

        // Split the block repeatedly. The front half keeps the address.
        for level in init_level..target_level {
            unsafe { self.split(block, level) };
        }

        let n = self.geometry.leaves_per_block(target_level);
        self.allocated.set_range(leaf, leaf + n, 1);

        let size = self.geometry.block_size(target_level);
        self.total_allocated += size;

        log::trace!("allocate level {target_level} leaf {leaf} ({size} bytes)");

        // The returned block inherits the provenance of the base pointer.
        Ok(self.base.with_addr_and_size(block, size))
    }

    /// Splits the detached block at `level`, keeping the front half and
    /// freeing the back half at `level + 1`.
    ///
    /// # Safety
    ///
    /// `block` must be the address of a block at `level` that is in no free
    /// list and is not handed out.
    unsafe fn split(&mut self, block: NonZeroUsize, level: usize) {
        let leaf = self.leaf_of(block);
        let n = self.geometry.leaves_per_block(level);

        self.levels.set_range(leaf, leaf + n, level as u64 + 1);

        let back_half = self.addr_of(leaf + n / 2);
        unsafe { self.free_lists.push(self.base, level + 1, back_half) };

        log::trace!("split level {level} leaf {leaf}");
    }

    #[cold]
    fn exhausted<T>(&self, layout: Layout) -> Result<T, AllocError> {
        if self.abort_on_oom {
            abort_on_exhaustion(layout);
        }

        Err(AllocError)
    }

    /// Deallocates the block referenced by `ptr` and merges it with its
    /// buddies as far as possible.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator. Violations are caught by assertions in debug builds.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let g = self.geometry;
        let addr = ptr.addr();

        debug_assert!(self.base.contains_addr(addr), "pointer outside of buffer");

        let ofs = self.base.offset_to(addr);
        debug_assert!(ofs >= g.unavailable, "pointer into unavailable prefix");
        debug_assert_eq!(ofs % g.leaf_size, 0, "pointer not aligned to a leaf");

        let mut leaf = ofs / g.leaf_size;
        let mut level = self.levels.get(leaf) as usize;
        let size = g.block_size(level);

        debug_assert_eq!(self.allocated.get(leaf), 1, "double free");
        debug_assert_eq!(
            leaf % g.leaves_per_block(level),
            0,
            "pointer is not the start of a block"
        );
        debug_assert!(self.total_allocated >= size, "freed more than allocated");

        self.total_allocated -= size;
        self.allocated
            .set_range(leaf, leaf + g.leaves_per_block(level), 0);
        unsafe { self.free_lists.push(self.base, level, addr) };

        log::trace!("deallocate level {level} leaf {leaf} ({size} bytes)");

        while level > 0 {
            let n = g.leaves_per_block(level);
            let (left, right) = if (leaf / n) % 2 == 0 {
                (leaf, leaf + n)
            } else {
                (leaf - n, leaf)
            };

            let free_at_level =
                |i: usize| self.allocated.get(i) == 0 && self.levels.get(i) == level as u64;

            if !(free_at_level(left) && free_at_level(right)) {
                break;
            }

            unsafe {
                self.free_lists.remove(self.base, level, self.addr_of(left));
                self.free_lists.remove(self.base, level, self.addr_of(right));
            }

            level -= 1;
            self.levels.set_range(left, left + 2 * n, level as u64);
            unsafe { self.free_lists.push(self.base, level, self.addr_of(left)) };

            log::trace!("merge level {} leaves {left} and {right}", level + 1);

            leaf = left;
        }
    }

    /// Returns the size of the block referenced by `ptr`.
    ///
    /// `ptr` must denote a block currently allocated via this allocator.
    pub fn allocated_size(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.addr();
        debug_assert!(self.base.contains_addr(addr), "pointer outside of buffer");

        let leaf = self.leaf_of(addr);
        debug_assert_eq!(self.allocated.get(leaf), 1, "block is not allocated");

        self.geometry.block_size(self.levels.get(leaf) as usize)
    }

    /// Returns an iterator over every block of the buffer in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            geometry: &self.geometry,
            levels: &self.levels,
            allocated: &self.allocated,
            leaf: 0,
        }
    }

    /// Returns an iterator over the first leaves of the free blocks at
    /// `level`, most recently freed first.
    ///
    /// # Panics
    ///
    /// Panics if `level >= self.num_levels()`.
    pub fn free_blocks(&self, level: usize) -> impl Iterator<Item = usize> + '_ {
        // The borrow of `self` keeps the list unmodified.
        unsafe { self.free_lists.iter(self.base, level) }.map(move |addr| self.leaf_of(addr))
    }

    /// Returns a printable dump of the leaf tables and the free lists.
    ///
    /// Each leaf prints as `leaf=(level, state)`, eight to a row, where the
    /// state is `x` for allocated and `o` for free. Each free block then
    /// prints as `leaf at level`.
    pub fn level_map(&self) -> LevelMap<'_> {
        LevelMap {
            base: self.base,
            leaf_size: self.geometry.leaf_size,
            free_lists: &self.free_lists,
            levels: &self.levels,
            allocated: &self.allocated,
        }
    }

    /// Walks the leaf tables and the free lists and panics if they are
    /// inconsistent with each other or with the allocation counters.
    ///
    /// This is linear in the number of leaves (quadratic in the length of
    /// the longest free list) and is meant for tests and fuzzing.
    pub fn check_invariants(&self) {
        let g = &self.geometry;
        let mut free_per_level = [0usize; u64::BITS as usize];
        let (mut free, mut allocated, mut unavailable) = (0, 0, 0);

        let mut leaf = 0;
        while leaf < g.num_leaves() {
            let level = self.levels.get(leaf) as usize;
            assert!(level < g.num_levels, "leaf {leaf}: level {level} out of range");

            let n = g.leaves_per_block(level);
            assert_eq!(leaf % n, 0, "leaf {leaf}: misaligned block at level {level}");
            assert!(leaf + n <= g.num_leaves(), "leaf {leaf}: block overruns buffer");

            let bit = self.allocated.get(leaf);
            for j in leaf..leaf + n {
                assert_eq!(self.levels.get(j) as usize, level, "leaf {j}: level differs from block");
                assert_eq!(self.allocated.get(j), bit, "leaf {j}: state differs from block");
            }

            let size = g.block_size(level);
            if bit == 0 {
                free += size;
                free_per_level[level] += 1;
            } else if leaf * g.leaf_size < g.unavailable {
                assert!(
                    (leaf + n) * g.leaf_size <= g.unavailable,
                    "leaf {leaf}: block straddles the unavailable prefix"
                );
                unavailable += size;
            } else {
                allocated += size;
            }

            leaf += n;
        }

        assert_eq!(allocated, self.total_allocated, "allocated byte count mismatch");
        assert_eq!(unavailable, g.unavailable, "unavailable byte count mismatch");
        assert_eq!(allocated + free + unavailable, g.buffer_size, "bytes not conserved");

        for (level, &expected) in free_per_level.iter().enumerate().take(g.num_levels) {
            let mut count = 0;
            for (i, leaf) in self.free_blocks(level).enumerate() {
                assert_eq!(self.allocated.get(leaf), 0, "leaf {leaf}: allocated block in free list");
                assert_eq!(self.levels.get(leaf) as usize, level, "leaf {leaf}: in wrong free list");
                assert_eq!(leaf % g.leaves_per_block(level), 0, "leaf {leaf}: misaligned free block");
                assert!(
                    self.free_blocks(level).skip(i + 1).all(|other| other != leaf),
                    "leaf {leaf}: listed twice at level {level}"
                );
                count += 1;
            }
            assert_eq!(count, expected, "level {level}: free list length mismatch");
        }
    }
}

#[cfg(any(feature = "alloc", test))]
fn abort_on_exhaustion(layout: Layout) -> ! {
    alloc::alloc::handle_alloc_error(layout)
}

#[cfg(not(any(feature = "alloc", test)))]
fn abort_on_exhaustion(layout: Layout) -> ! {
    panic!("buddy allocator exhausted: {layout:?}")
}

impl<A: BackingAllocator, E: BackingAllocator> Drop for BuddyAllocator<A, E> {
    fn drop(&mut self) {
        let buffer_layout = self.geometry.buffer_layout();

        unsafe {
            self.main.deallocate(self.base.ptr(), buffer_layout);
            self.extra.deallocate(self.metadata, self.metadata_layout);
        }

        if self.total_allocated != 0 {
            log::error!(
                "buddy allocator ({} bytes, {}-byte leaves) dropped with {} bytes still allocated",
                self.geometry.buffer_size,
                self.geometry.leaf_size,
                self.total_allocated,
            );
            debug_assert!(false, "buddy allocator leaked {} bytes", self.total_allocated);
        } else {
            log::debug!("buddy allocator ({} bytes) dropped", self.geometry.buffer_size);
        }
    }
}

impl<A: BackingAllocator, E: BackingAllocator> fmt::Debug for BuddyAllocator<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("geometry", &self.geometry)
            .field("total_allocated", &self.total_allocated)
            .field("abort_on_oom", &self.abort_on_oom)
            .finish()
    }
}

/// Like a `BuddyAllocator`, but without a `Drop` impl or backing allocators.
///
/// This can be moved out of, while `BuddyAllocator` itself cannot.
struct BuddyParts {
    base: BasePtr,
    metadata: NonNull<u8>,
    metadata_layout: Layout,
    geometry: Geometry,
    free_lists: FreeLists,
    levels: PackedArray,
    allocated: PackedArray,
}

impl BuddyParts {
    /// Lays out the metadata tables and carves the buffer into its initial
    /// free blocks.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `buffer` must be valid for reads and writes for
    ///   `geometry.buffer_size()` bytes and aligned to `geometry.leaf_size()`.
    /// - `metadata` must be valid for reads and writes for `meta.layout` and
    ///   satisfy its alignment.
    /// - Neither region may be accessed by anything else while the parts, or
    ///   the allocator built from them, exist.
    unsafe fn new(
        buffer: NonNull<u8>,
        metadata: NonNull<u8>,
        geometry: Geometry,
        meta: MetadataLayout,
    ) -> BuddyParts {
        let table = |ofs: usize| unsafe { NonNull::new_unchecked(metadata.as_ptr().add(ofs)) };

        let free_lists = unsafe { FreeLists::new(metadata.cast(), geometry.num_levels) };
        let levels = unsafe {
            PackedArray::new(
                geometry.level_bits(),
                geometry.num_leaves(),
                table(meta.levels_ofs).cast(),
            )
        };
        let allocated =
            unsafe { PackedArray::new(1, geometry.num_leaves(), table(meta.allocated_ofs).cast()) };

        let mut parts = BuddyParts {
            base: BasePtr::new(buffer, geometry.buffer_size),
            metadata,
            metadata_layout: meta.layout,
            geometry,
            free_lists,
            levels,
            allocated,
        };

        unsafe { parts.carve() };

        parts
    }

    /// Builds the initial free lists.
    ///
    /// With no unavailable prefix, the whole buffer is one free block.
    /// Otherwise, starting from the whole buffer, the block straddling the
    /// end of the prefix is halved until the prefix ends on a block boundary;
    /// halves entirely inside the prefix are cordoned off and halves entirely
    /// past it are freed.
    ///
    /// # Safety
    ///
    /// Must be called once, on freshly zeroed tables.
    unsafe fn carve(&mut self) {
        let g = self.geometry;
        let cordon = g.unavailable / g.leaf_size;

        if cordon == 0 {
            unsafe { self.free_lists.push(self.base, 0, self.base.addr()) };
            return;
        }

        let mut first = 0;
        let mut level = 0;
        loop {
            level += 1;
            let n = g.leaves_per_block(level);
            let mid = first + n;

            if cordon <= mid {
                self.levels.set_range(mid, mid + n, level as u64);
                let back = self.base.addr_at(mid * g.leaf_size);
                unsafe { self.free_lists.push(self.base, level, back) };

                if cordon == mid {
                    self.cordon_off(first, level);
                    break;
                }
            } else {
                self.cordon_off(first, level);
                first = mid;
            }
        }
    }

    fn cordon_off(&mut self, first: usize, level: usize) {
        let n = self.geometry.leaves_per_block(level);
        self.levels.set_range(first, first + n, level as u64);
        self.allocated.set_range(first, first + n, 1);
    }

    fn with_allocators<A: BackingAllocator, E: BackingAllocator>(
        self,
        abort_on_oom: bool,
        main: A,
        extra: E,
    ) -> BuddyAllocator<A, E> {
        let BuddyParts {
            base,
            metadata,
            metadata_layout,
            geometry,
            free_lists,
            levels,
            allocated,
        } = self;

        BuddyAllocator {
            base,
            metadata,
            metadata_layout,
            geometry,
            abort_on_oom,
            free_lists,
            levels,
            allocated,
            total_allocated: 0,
            main,
            extra,
        }
    }
}

/// An iterator over the blocks of a [`BuddyAllocator`].
///
/// Returned by [`BuddyAllocator::blocks`].
#[derive(Debug)]
pub struct Blocks<'a> {
    geometry: &'a Geometry,
    levels: &'a PackedArray,
    allocated: &'a PackedArray,
    leaf: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let g = self.geometry;
        if self.leaf >= g.num_leaves() {
            return None;
        }

        let leaf = self.leaf;
        let level = self.levels.get(leaf) as usize;

        let state = if self.allocated.get(leaf) == 0 {
            BlockState::Free
        } else if leaf * g.leaf_size < g.unavailable {
            BlockState::Unavailable
        } else {
            BlockState::Allocated
        };

        self.leaf += g.leaves_per_block(level);

        Some(BlockInfo {
            leaf,
            level,
            size: g.block_size(level),
            state,
        })
    }
}

/// A printable dump of a [`BuddyAllocator`]'s tables.
///
/// Returned by [`BuddyAllocator::level_map`].
#[derive(Debug)]
pub struct LevelMap<'a> {
    base: BasePtr,
    leaf_size: usize,
    free_lists: &'a FreeLists,
    levels: &'a PackedArray,
    allocated: &'a PackedArray,
}

impl fmt::Display for LevelMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PER_ROW: usize = 8;

        let entries = self.levels.iter().zip(self.allocated.iter()).enumerate();
        for (leaf, (level, allocated)) in entries {
            if leaf % PER_ROW != 0 {
                f.write_str(" ")?;
            }

            let state = if allocated == 1 { 'x' } else { 'o' };
            write!(f, "{leaf}=({level}, {state})")?;

            if (leaf + 1) % PER_ROW == 0 {
                writeln!(f)?;
            }
        }

        if self.levels.len() % PER_ROW != 0 {
            writeln!(f)?;
        }

        for level in 0..self.free_lists.num_levels() {
            for addr in unsafe { self.free_lists.iter(self.base, level) } {
                let leaf = self.base.offset_to(addr) / self.leaf_size;
                writeln!(f, "{leaf} at {level}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::Cell;
    use std::{format, vec, vec::Vec};

    use super::*;

    const LEAF: usize = 4096;
    const SIZE: usize = 64 << 10;

    fn fresh() -> BuddyAllocator<Global> {
        BuddyAllocator::try_new(Config::new(SIZE, LEAF)).unwrap()
    }

    fn leaf_layout() -> Layout {
        Layout::from_size_align(LEAF, 1).unwrap()
    }

    fn levels(a: &BuddyAllocator<Global>) -> Vec<u64> {
        a.levels.iter().collect()
    }

    fn allocated(a: &BuddyAllocator<Global>) -> Vec<u64> {
        a.allocated.iter().collect()
    }

    fn offset<A: BackingAllocator, E: BackingAllocator>(
        a: &BuddyAllocator<A, E>,
        ptr: NonNull<[u8]>,
    ) -> usize {
        a.base.offset_to(ptr.cast::<u8>().addr())
    }

    #[test]
    fn geometry_of_64k() {
        let g = Config::new(SIZE, LEAF).geometry().unwrap();
        assert_eq!(g.buffer_size(), SIZE);
        assert_eq!(g.num_levels(), 5);
        assert_eq!(g.num_leaves(), 16);
        assert_eq!(g.unavailable(), 0);
        assert_eq!(g.level_bits(), 3);
        assert_eq!(g.leaves_per_block(0), 16);
        assert_eq!(g.leaves_per_block(4), 1);
        assert_eq!(g.block_size(2), 16 << 10);
        assert_eq!(g.level_for(0), Some(4));
        assert_eq!(g.level_for(1), Some(4));
        assert_eq!(g.level_for(4097), Some(3));
        assert_eq!(g.level_for(SIZE), Some(0));
        assert_eq!(g.level_for(SIZE + 1), None);
    }

    #[test]
    fn config_errors() {
        let err = |size, leaf| Config::new(size, leaf).geometry().unwrap_err();

        assert_eq!(err(0, LEAF), ConfigError::ZeroSize);
        assert_eq!(err(SIZE, 0), ConfigError::ZeroSize);
        assert_eq!(err(SIZE, 3000), ConfigError::LeafNotPowerOfTwo);
        assert_eq!(err(SIZE, 8), ConfigError::LeafTooSmall);
        assert_eq!(err(3000, LEAF), ConfigError::LeafLargerThanBuffer);
        assert_eq!(err(usize::MAX, LEAF), ConfigError::SizeOverflow);

        assert!(matches!(
            BuddyAllocator::try_new(Config::new(SIZE, 3)),
            Err(AllocInitError::InvalidConfig(ConfigError::LeafNotPowerOfTwo))
        ));
    }

    #[test]
    fn unavailable_rounds_to_leaves() {
        let g = Config::new(48 << 10, LEAF).geometry().unwrap();
        assert_eq!(g.buffer_size(), SIZE);
        assert_eq!(g.unavailable(), 16 << 10);
        assert_eq!(g.capacity(), 48 << 10);

        let g = Config::new((48 << 10) + 100, LEAF).geometry().unwrap();
        assert_eq!(g.unavailable(), 12 << 10);
    }

    #[test]
    fn fresh_allocator_is_one_block() {
        let a = fresh();
        a.check_invariants();

        assert_eq!(a.free_blocks(0).collect::<Vec<_>>(), [0]);
        assert_eq!(
            a.blocks().collect::<Vec<_>>(),
            [BlockInfo {
                leaf: 0,
                level: 0,
                size: SIZE,
                state: BlockState::Free
            }]
        );
        assert_eq!(a.free_bytes(), SIZE);
    }

    #[test]
    fn exact_fit_reuse() {
        let mut a = fresh();

        let first = a.allocate(leaf_layout()).unwrap();
        unsafe { a.deallocate(first.cast()) };
        let second = a.allocate(leaf_layout()).unwrap();

        assert_eq!(first.cast::<u8>(), second.cast::<u8>());
        assert_eq!(a.total_allocated(), LEAF);

        unsafe { a.deallocate(second.cast()) };
        a.check_invariants();
    }

    #[test]
    fn split_chain() {
        let mut a = fresh();
        let block = a.allocate(leaf_layout()).unwrap();

        assert_eq!(block.len(), LEAF);
        assert_eq!(offset(&a, block), 0);
        assert_eq!(
            levels(&a),
            [4, 4, 3, 3, 2, 2, 2, 2, 1, 1, 1, 1, 1, 1, 1, 1]
        );
        let mut expected = vec![0; 16];
        expected[0] = 1;
        assert_eq!(allocated(&a), expected);

        for (level, leaf) in [(1, 8), (2, 4), (3, 2), (4, 1)] {
            assert_eq!(a.free_blocks(level).collect::<Vec<_>>(), [leaf]);
        }
        a.check_invariants();

        unsafe { a.deallocate(block.cast()) };
    }

    #[test]
    fn full_merge() {
        let mut a = fresh();

        let blocks: Vec<_> = (0..16).map(|_| a.allocate(leaf_layout()).unwrap()).collect();
        assert_eq!(a.total_allocated(), SIZE);
        assert!(a.allocate(leaf_layout()).is_err());

        for block in blocks.into_iter().rev() {
            unsafe { a.deallocate(block.cast()) };
            a.check_invariants();
        }

        assert_eq!(a.total_allocated(), 0);
        assert_eq!(a.free_blocks(0).collect::<Vec<_>>(), [0]);
        for level in 1..a.num_levels() {
            assert_eq!(a.free_blocks(level).count(), 0);
        }
    }

    #[test]
    fn no_merge_on_mismatched_level() {
        let mut a = fresh();

        let small = a.allocate(leaf_layout()).unwrap();
        let large = a.allocate(Layout::from_size_align(2 * LEAF, 1).unwrap()).unwrap();
        assert_eq!(offset(&a, large), 2 * LEAF);
        assert_eq!(a.allocated_size(large.cast()), 2 * LEAF);

        unsafe { a.deallocate(small.cast()) };
        a.check_invariants();

        // Leaves 0 and 1 merge, but the level-3 buddy at leaf 2 is allocated.
        assert_eq!(&levels(&a)[..4], [3, 3, 3, 3]);
        assert_eq!(a.free_blocks(3).collect::<Vec<_>>(), [0]);
        assert_eq!(a.free_blocks(4).count(), 0);
        assert_eq!(a.free_blocks(0).count(), 0);

        unsafe { a.deallocate(large.cast()) };
        a.check_invariants();

        assert_eq!(a.free_blocks(0).collect::<Vec<_>>(), [0]);
        assert!(levels(&a).iter().all(|&l| l == 0));
    }

    #[test]
    fn non_power_of_two_total() {
        let mut a = BuddyAllocator::try_new(Config::new(48 << 10, LEAF)).unwrap();
        a.check_invariants();

        let initial: Vec<_> = a.blocks().collect();
        assert_eq!(
            initial,
            [
                BlockInfo {
                    leaf: 0,
                    level: 2,
                    size: 16 << 10,
                    state: BlockState::Unavailable
                },
                BlockInfo {
                    leaf: 4,
                    level: 2,
                    size: 16 << 10,
                    state: BlockState::Free
                },
                BlockInfo {
                    leaf: 8,
                    level: 1,
                    size: 32 << 10,
                    state: BlockState::Free
                },
            ]
        );
        assert_eq!(a.total_allocated(), 0);
        assert_eq!(a.unavailable(), 16 << 10);

        assert!(a
            .allocate(Layout::from_size_align(48 << 10, 1).unwrap())
            .is_err());

        let mut blocks = Vec::new();
        while let Ok(block) = a.allocate(leaf_layout()) {
            assert!(offset(&a, block) >= a.unavailable());
            blocks.push(block);
        }
        assert_eq!(blocks.len(), 12);
        assert_eq!(a.total_allocated(), 48 << 10);
        a.check_invariants();

        for block in blocks {
            unsafe { a.deallocate(block.cast()) };
        }
        a.check_invariants();
        assert_eq!(a.blocks().collect::<Vec<_>>(), initial);
    }

    #[test]
    fn odd_prefix_carves_every_level() {
        // 5 of 16 leaves unavailable: cordons at levels 2 and 4.
        let a = BuddyAllocator::try_new(Config::new(44 << 10, LEAF)).unwrap();
        a.check_invariants();

        let summary: Vec<_> = a.blocks().map(|b| (b.leaf, b.level, b.state)).collect();
        assert_eq!(
            summary,
            [
                (0, 2, BlockState::Unavailable),
                (4, 4, BlockState::Unavailable),
                (5, 4, BlockState::Free),
                (6, 3, BlockState::Free),
                (8, 1, BlockState::Free),
            ]
        );
        assert_eq!(a.capacity(), 44 << 10);
    }

    #[test]
    fn oom_is_recoverable() {
        let mut a = fresh();

        let blocks: Vec<_> = (0..4)
            .map(|_| a.allocate(Layout::from_size_align(16 << 10, 1).unwrap()).unwrap())
            .collect();

        let before = format!("{}", a.level_map());
        assert!(a.allocate(leaf_layout()).is_err());
        assert!(a.allocate(Layout::from_size_align(SIZE, 1).unwrap()).is_err());
        assert_eq!(format!("{}", a.level_map()), before);
        assert_eq!(a.total_allocated(), SIZE);

        for block in blocks {
            unsafe { a.deallocate(block.cast()) };
        }
        assert_eq!(a.total_allocated(), 0);
        a.check_invariants();
    }

    #[test]
    fn refuses_large_alignment() {
        let mut a = BuddyAllocator::try_new(Config::new(SIZE, LEAF).abort_on_oom(true)).unwrap();

        assert!(a
            .allocate(Layout::from_size_align(LEAF, 2 * LEAF).unwrap())
            .is_err());
        assert_eq!(a.total_allocated(), 0);

        let block = a.allocate(Layout::from_size_align(100, LEAF).unwrap()).unwrap();
        assert_eq!(block.cast::<u8>().addr().get() % LEAF, 0);
        unsafe { a.deallocate(block.cast()) };
    }

    #[test]
    fn zero_size_is_one_leaf() {
        let mut a = fresh();
        let block = a.allocate(Layout::from_size_align(0, 1).unwrap()).unwrap();

        assert_eq!(block.len(), LEAF);
        assert_eq!(a.allocated_size(block.cast()), LEAF);
        unsafe { a.deallocate(block.cast()) };
    }

    #[test]
    fn queries_have_no_side_effects() {
        let mut a = fresh();
        let block = a.allocate(Layout::from_size_align(5000, 1).unwrap()).unwrap();

        let before = format!("{}", a.level_map());
        for _ in 0..3 {
            assert_eq!(a.allocated_size(block.cast()), 2 * LEAF);
            assert_eq!(a.total_allocated(), 2 * LEAF);
        }
        assert_eq!(format!("{}", a.level_map()), before);

        unsafe { a.deallocate(block.cast()) };
    }

    #[test]
    fn level_map_format() {
        let mut a = BuddyAllocator::try_new(Config::new(64, 16)).unwrap();
        let block = a.allocate(Layout::from_size_align(16, 1).unwrap()).unwrap();

        assert_eq!(
            format!("{}", a.level_map()),
            "0=(2, x) 1=(2, o) 2=(1, o) 3=(1, o)\n2 at 1\n1 at 2\n"
        );

        unsafe { a.deallocate(block.cast()) };
        assert_eq!(
            format!("{}", a.level_map()),
            "0=(0, o) 1=(0, o) 2=(0, o) 3=(0, o)\n0 at 0\n"
        );
    }

    #[test]
    fn level_map_wraps_rows() {
        let a = BuddyAllocator::try_new(Config::new(16 * 16, 16)).unwrap();
        let map = format!("{}", a.level_map());
        let lines: Vec<_> = map.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0=(0, o) 1=(0, o)"));
        assert!(lines[1].starts_with("8=(0, o)"));
        assert_eq!(lines[2], "0 at 0");
    }

    #[test]
    fn nested_engines() {
        let inner = RefCellBuddyAllocator::new(
            BuddyAllocator::try_new(Config::new(SIZE, LEAF)).unwrap(),
        );

        {
            let mut outer =
                BuddyAllocator::try_new_in(Config::new(16 << 10, LEAF), &inner, Global).unwrap();
            assert_eq!(inner.inner().borrow().total_allocated(), 16 << 10);

            let block = outer.allocate(leaf_layout()).unwrap();
            unsafe { block.cast::<u8>().as_ptr().write_bytes(0xA5, LEAF) };
            assert_eq!(outer.total_allocated(), LEAF);
            unsafe { outer.deallocate(block.cast()) };
        }

        let inner = inner.into_inner().into_inner();
        assert_eq!(inner.total_allocated(), 0);
        inner.check_invariants();
    }

    #[cfg(feature = "std")]
    #[test]
    fn mutex_wrapper_backs_allocations() {
        let shared = MutexBuddyAllocator::new(fresh());

        let a = shared.allocate(leaf_layout()).unwrap();
        let b = shared.allocate(leaf_layout()).unwrap();
        assert_ne!(a.cast::<u8>(), b.cast::<u8>());

        unsafe {
            shared.deallocate(a.cast(), leaf_layout());
            shared.deallocate(b.cast(), leaf_layout());
        }
        assert_eq!(shared.inner().lock().unwrap().total_allocated(), 0);
    }

    /// Tracks outstanding bytes from the global allocator.
    #[derive(Default)]
    struct Counting {
        outstanding: Cell<usize>,
    }

    unsafe impl BackingAllocator for Counting {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            let block = Global.allocate(layout)?;
            self.outstanding.set(self.outstanding.get() + layout.size());
            Ok(block)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.outstanding.set(self.outstanding.get() - layout.size());
            unsafe { Global.deallocate(ptr, layout) };
        }
    }

    struct Failing;

    unsafe impl BackingAllocator for Failing {
        fn allocate(&self, _: Layout) -> Result<NonNull<[u8]>, AllocError> {
            Err(AllocError)
        }

        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
            unreachable!("nothing was allocated");
        }
    }

    #[test]
    fn metadata_failure_releases_buffer() {
        let main = Counting::default();

        let result = BuddyAllocator::try_new_in(Config::new(SIZE, LEAF), &main, Failing);
        match result {
            Err(AllocInitError::AllocFailed(layout)) => assert_ne!(layout.size(), SIZE),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(main.outstanding.get(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let main = Counting::default();
        let extra = Counting::default();

        {
            let mut a = BuddyAllocator::try_new_in(Config::new(SIZE, LEAF), &main, &extra).unwrap();
            assert_eq!(main.outstanding.get(), SIZE);
            assert!(extra.outstanding.get() > 0);

            let block = a.allocate(leaf_layout()).unwrap();
            unsafe { a.deallocate(block.cast()) };
        }

        assert_eq!(main.outstanding.get(), 0);
        assert_eq!(extra.outstanding.get(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "leaked")]
    fn leak_is_fatal_in_debug() {
        let mut a = fresh();
        let _ = a.allocate(leaf_layout()).unwrap();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_caught() {
        let mut a = fresh();
        let block = a.allocate(leaf_layout()).unwrap();

        unsafe {
            a.deallocate(block.cast());
            a.deallocate(block.cast());
        }
    }
}
