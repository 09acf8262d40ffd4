#![deny(unsafe_op_in_unsafe_fn)]

use std::{
    alloc::Layout,
    panic::{self, AssertUnwindSafe},
    ptr::NonNull,
};

use alloc_hater::Subject;
use scaffold_alloc::{AllocInitError, BuddyAllocator, Config, FixedBuddy, Global};

/// Runs the engine's invariant walk, reporting a violation as `false`.
fn audit_engine<A, E>(buddy: &BuddyAllocator<A, E>) -> bool
where
    A: scaffold_alloc::BackingAllocator,
    E: scaffold_alloc::BackingAllocator,
{
    panic::catch_unwind(AssertUnwindSafe(|| buddy.check_invariants())).is_ok()
}

pub struct BuddySubject(BuddyAllocator<Global>);

impl BuddySubject {
    pub fn new(config: Config) -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new(config)?;
        Ok(BuddySubject(b))
    }

    pub fn inner(&self) -> &BuddyAllocator<Global> {
        &self.0
    }
}

impl Subject for BuddySubject {
    type AllocError = scaffold_alloc::AllocError;

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { self.0.deallocate(ptr) };
    }

    fn audit(&self) -> bool {
        audit_engine(&self.0)
    }
}

pub struct FixedSubject<const SIZE: usize, const LEAF: usize>(FixedBuddy<SIZE, LEAF, Global>);

impl<const SIZE: usize, const LEAF: usize> FixedSubject<SIZE, LEAF> {
    pub fn new() -> Result<Self, AllocInitError> {
        let f = FixedBuddy::try_new()?;
        Ok(FixedSubject(f))
    }
}

impl<const SIZE: usize, const LEAF: usize> Subject for FixedSubject<SIZE, LEAF> {
    type AllocError = scaffold_alloc::AllocError;

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { self.0.deallocate(ptr) };
    }

    fn audit(&self) -> bool {
        audit_engine(self.0.inner())
    }
}
