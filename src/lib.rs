//! Power-of-two buddy allocation over a fixed backing buffer.
//!
//! A [`BuddyAllocator`] manages one buffer obtained from a *main* allocator,
//! with its bookkeeping (per-level free-list heads and two bit-packed tables
//! indexed by leaf) obtained from an *extra* allocator. Both are expressed by
//! the [`BackingAllocator`] trait, which the engine also implements through
//! its [`RefCellBuddyAllocator`] wrapper, so engines can be stacked.
//!
//! ```
//! use core::alloc::Layout;
//! use scaffold_alloc::{BuddyAllocator, Config};
//!
//! // 48 KiB of usable space in 4 KiB leaves, padded to 64 KiB internally.
//! let mut buddy = BuddyAllocator::try_new(Config::new(48 << 10, 4096)).unwrap();
//!
//! let block = buddy.allocate(Layout::new::<[u64; 100]>()).unwrap();
//! assert_eq!(block.len(), 4096);
//!
//! unsafe { buddy.deallocate(block.cast()) };
//! assert_eq!(buddy.total_allocated(), 0);
//! ```

#![doc(html_root_url = "https://docs.rs/scaffold_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
pub mod buddy;
mod fixed;
mod free_list;
mod packed;
mod polyfill;


use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    buddy::{
        BlockInfo, BlockState, BuddyAllocator, Config, Geometry, LevelMap, RefCellBuddyAllocator,
    },
    fixed::FixedBuddy,
};

#[cfg(feature = "std")]
pub use crate::buddy::MutexBuddyAllocator;

/// The error type for allocator constructors.
#[derive(Clone, Debug)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed buffer, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidConfig(ConfigError),
}

impl From<ConfigError> for AllocInitError {
    fn from(e: ConfigError) -> Self {
        AllocInitError::InvalidConfig(e)
    }
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocInitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocInitError::InvalidConfig(e) => Some(e),
            AllocInitError::AllocFailed(_) => None,
        }
    }
}

/// A reason why a [`Config`] cannot be turned into an allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The size or the leaf size is zero.
    ZeroSize,
    /// The leaf size is not a power of two.
    LeafNotPowerOfTwo,
    /// The leaf size cannot hold a free-list header.
    LeafTooSmall,
    /// The leaf size exceeds the requested size.
    LeafLargerThanBuffer,
    /// The buffer would have more levels than a packed table word has bits.
    TooManyLevels,
    /// The padded buffer or its metadata is too large to describe.
    SizeOverflow,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ConfigError::ZeroSize => "size and leaf size must be nonzero",
            ConfigError::LeafNotPowerOfTwo => "leaf size must be a power of two",
            ConfigError::LeafTooSmall => "leaf size must hold a free-list header",
            ConfigError::LeafLargerThanBuffer => "leaf size must not exceed the buffer size",
            ConfigError::TooManyLevels => "too many levels",
            ConfigError::SizeOverflow => "buffer size overflows",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

/// Types which provide memory which backs an allocator.
///
/// This mirrors the two operations of the standard `Allocator` trait that an
/// allocator needs from its collaborators. It is implemented by the following
/// types:
/// - [`Global`], the global allocator.
/// - `&A` for any `A: BackingAllocator`, so a backing allocator can be shared.
/// - The [`BuddyAllocator`] wrappers, so one engine can back another.
///
/// # Safety
///
/// Memory blocks returned from `allocate` must point to valid memory of at
/// least `layout.size()` bytes aligned to `layout.align()`, and must retain
/// their validity until they are passed to `deallocate` or the allocator is
/// dropped.
pub unsafe trait BackingAllocator {
    /// Attempts to allocate a block of memory fitting `layout`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the memory cannot be provided.
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError>;

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

unsafe impl<A: BackingAllocator + ?Sized> BackingAllocator for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
/// The global memory allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
unsafe impl BackingAllocator for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = if layout.size() == 0 {
            // SAFETY: alignments are nonzero.
            unsafe { NonNull::new_unchecked(sptr::invalid_mut::<u8>(layout.align())) }
        } else {
            NonNull::new(unsafe { alloc::alloc::alloc(layout) }).ok_or(AllocError)?
        };

        let slice = core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), layout.size());

        Ok(unsafe { NonNull::new_unchecked(slice) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}
