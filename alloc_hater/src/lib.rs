//! A small library for ~~hating on~~ evaluating the correctness of allocators.
//!
//! An [`Evaluator`] replays a sequence of [`AllocatorOp`]s against a
//! [`Subject`], painting every block it receives with the id of the op that
//! produced it and verifying the paint before the block is returned. After
//! every op the subject may audit its own bookkeeping.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{alloc::Layout, fmt, mem::MaybeUninit, ptr::NonNull, slice};

/// Largest request size generated by [`ArbLayout`], in bits.
const MAX_SIZE_BITS: u8 = 20;

/// Largest alignment generated by [`ArbLayout`], in bits.
const MAX_ALIGN_BITS: u8 = 16;

/// A wrapper around `Layout` which implements `Arbitrary`.
///
/// Sizes are drawn from a log-uniform distribution below 1 MiB, so that small
/// requests are as common as large ones; alignments go up to 64 KiB.
#[derive(Clone, Debug)]
pub struct ArbLayout(pub Layout);

impl arbitrary::Arbitrary<'_> for ArbLayout {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a power of two.
        let align_shift = u8::arbitrary(u)? % (MAX_ALIGN_BITS + 1);
        let align: usize = 1 << align_shift;

        let size_bits = u8::arbitrary(u)? % (MAX_SIZE_BITS + 1);
        let size = usize::arbitrary(u)? % (1 << size_bits);

        let layout = match Layout::from_size_align(size, align) {
            Ok(l) => l,
            Err(_) => {
                panic!("invalid layout params: size=0x{size:X} align=0x{align:X}");
            }
        };

        Ok(ArbLayout(layout))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

/// One step of an evaluation.
#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a block fitting the layout.
    Alloc(Layout),
    /// Free an outstanding block. Given `n` outstanding blocks, the block at
    /// index `idx % n` is freed; with none outstanding, this is a no-op.
    Dealloc(usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbLayout::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError;

    /// Allocates a block of memory according to `layout`.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block of memory with layout `layout` pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `layout`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);

    /// Checks the allocator's internal consistency. Called after every op.
    fn audit(&self) -> bool {
        true
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The requested allocation layout.
    layout: Layout,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - `ptr` must have been allocated according to `layout`.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, layout: Layout, id: u64) -> Block {
        let mut b = Block { ptr, layout, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, Layout) {
        (self.ptr, self.layout)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }

    /// Returns `true` if the block is at least as large as requested and
    /// satisfies the requested alignment.
    pub fn fits_layout(&self) -> bool {
        let addr = self.ptr.cast::<u8>().as_ptr() as usize;
        self.ptr.len() >= self.layout.size() && addr % self.layout.align() == 0
    }
}

/// The reason an evaluation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// A returned block did not fit the requested layout.
    BadFit,
    /// A live block's contents changed while the allocator owned no part of it.
    Corrupted,
    /// The subject's own audit failed.
    Audit,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Failure::BadFit => "block does not fit its layout",
            Failure::Corrupted => "block was overwritten",
            Failure::Audit => "subject failed its audit",
        })
    }
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
    pub reason: Failure,
}

impl fmt::Display for Failed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {} ops", self.reason, self.completed.len())?;
        if let Some(op) = &self.failed_op {
            write!(f, " (at {op:?})")?;
        }
        Ok(())
    }
}

/// Statistics from a successful evaluation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Allocations that succeeded.
    pub allocated: usize,
    /// Allocations the subject refused.
    pub refused: usize,
    /// Blocks freed by `Dealloc` ops.
    pub freed: usize,
    /// Blocks still outstanding at the end, freed by the evaluator.
    pub leftover: usize,
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<Report, Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();
        let mut report = Report::default();

        let fail = |completed: Vec<AllocatorOp>, failed_op, reason| Failed {
            completed,
            failed_op,
            reason,
        };

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            match op {
                AllocatorOp::Alloc(layout) => {
                    let ptr = match self.subject.allocate(layout) {
                        Ok(p) => p,
                        Err(_) => {
                            report.refused += 1;
                            completed.push(op);
                            continue;
                        }
                    };

                    let block = unsafe { Block::init(ptr, layout, op_id) };
                    if !block.fits_layout() {
                        return Err(fail(completed, Some(op), Failure::BadFit));
                    }

                    blocks.push(block);
                    report.allocated += 1;
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => {
                            completed.push(op);
                            continue;
                        }
                    };

                    if !block.verify() {
                        return Err(fail(completed, Some(op), Failure::Corrupted));
                    }

                    block.paint(op_id);
                    let (ptr, layout) = block.into_raw_parts();
                    unsafe { self.subject.deallocate(ptr.cast(), layout) };
                    report.freed += 1;
                }
            }

            if !self.subject.audit() {
                return Err(fail(completed, Some(op), Failure::Audit));
            }

            completed.push(op);
        }

        report.leftover = blocks.len();

        let mut corrupted = false;
        for block in blocks {
            corrupted |= !block.verify();
            let (ptr, layout) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr.cast(), layout) };
        }

        if corrupted {
            return Err(fail(completed, None, Failure::Corrupted));
        }

        if !self.subject.audit() {
            return Err(fail(completed, None, Failure::Audit));
        }

        Ok(report)
    }
}
