//! Integer and pointer helpers.
//!
//! The strict-provenance methods mirror the standard library API and are
//! provided here through `sptr` so that the crate builds on older toolchains.

use core::{num::NonZeroUsize, ptr::NonNull};

use sptr::Strict;

pub trait UsizeExt {
    /// Floor of the base-2 logarithm. `self` must be nonzero.
    fn log2(self) -> u32;

    /// Rounds up to the nearest power of two, or `None` on overflow.
    ///
    /// Zero is clipped to one.
    fn clip_pow2(self) -> Option<usize>;

    /// Number of bits needed to represent every value in `0..self`.
    ///
    /// Always at least one.
    fn bits_to_index(self) -> u32;
}

impl UsizeExt for usize {
    #[inline]
    fn log2(self) -> u32 {
        Self::BITS - 1 - self.leading_zeros()
    }

    #[inline]
    fn clip_pow2(self) -> Option<usize> {
        self.checked_next_power_of_two()
    }

    #[inline]
    fn bits_to_index(self) -> u32 {
        match self {
            0 | 1 => 1,
            n => Self::BITS - (n - 1).leading_zeros(),
        }
    }
}

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(self.as_ptr().addr()) }
    }

    fn with_addr(self, addr: NonZeroUsize) -> Self
    where
        T: Sized,
    {
        // SAFETY: The result of `with_addr` is non-null because `addr` is
        // guaranteed to be non-zero.
        unsafe { NonNull::new_unchecked(self.as_ptr().with_addr(addr.get())) }
    }
}
