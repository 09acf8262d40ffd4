#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use scaffold_alloc::Config;
use scaffold_alloc_hater::BuddySubject;

const MAX_SIZE_BITS: u32 = 22;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    // Requested size is `(1 << size_bits) - trim`, so non-powers of two are
    // exercised along with every carving of the unavailable prefix.
    size_bits: u8,
    trim: u32,
    leaf_bits: u8,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let size_bits = u32::from(args.size_bits) % (MAX_SIZE_BITS + 1);
    let full = 1usize << size_bits;
    let size = full - (args.trim as usize % full);
    let leaf = 1usize << (u32::from(args.leaf_bits) % (size_bits + 1));

    let subject = match BuddySubject::new(Config::new(size, leaf)) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("{failed}: {failed:?}");
    }

    assert_eq!(eval.subject().inner().total_allocated(), 0);
});
