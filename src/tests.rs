extern crate std;

use core::{ptr::NonNull, slice};
use std::prelude::rust_2021::*;
use std::{format, vec};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{BlockError, Buddy, FirstFit, Global, HeapStats};

/// Limit on randomized allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

#[derive(Clone, Debug)]
enum ArenaOp {
    /// Allocate a buffer of `len` bytes.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at
    /// index `index % n`.
    Free { index: usize },
    /// Re-allocate an existing allocation to `len` bytes.
    Extend { index: usize, len: usize },
}

enum ArenaOpTag {
    Allocate,
    Free,
    Extend,
}

impl Arbitrary for ArenaOp {
    fn arbitrary(g: &mut Gen) -> Self {
        fn len(g: &mut Gen) -> usize {
            // Try to distribute allocations evenly between powers of two.
            let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
            usize::arbitrary(g) % 2_usize.pow(exp.into())
        }

        match g
            .choose(&[ArenaOpTag::Allocate, ArenaOpTag::Free, ArenaOpTag::Extend])
            .unwrap()
        {
            ArenaOpTag::Allocate => ArenaOp::Allocate { len: len(g) },
            ArenaOpTag::Free => ArenaOp::Free {
                index: usize::arbitrary(g),
            },
            ArenaOpTag::Extend => ArenaOp::Extend {
                index: usize::arbitrary(g),
                len: len(g),
            },
        }
    }
}

struct Allocation {
    id: u8,
    ptr: NonNull<u8>,
    len: usize,
}

/// The operations both arenas share, for driving them with the same
/// randomized workload.
trait Arena {
    fn alloc(&mut self, len: usize) -> Option<NonNull<u8>>;
    fn free(&mut self, ptr: NonNull<u8>) -> Result<(), BlockError>;
    fn realloc(&mut self, ptr: NonNull<u8>, len: usize)
        -> Result<Option<NonNull<u8>>, BlockError>;
    fn counters(&self) -> HeapStats;
}

impl Arena for Buddy<Global> {
    fn alloc(&mut self, len: usize) -> Option<NonNull<u8>> {
        self.allocate(len)
    }

    fn free(&mut self, ptr: NonNull<u8>) -> Result<(), BlockError> {
        unsafe { self.deallocate(ptr) }
    }

    fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        len: usize,
    ) -> Result<Option<NonNull<u8>>, BlockError> {
        unsafe { self.extend(Some(ptr), len) }
    }

    fn counters(&self) -> HeapStats {
        self.stats()
    }
}

impl Arena for FirstFit<Global> {
    fn alloc(&mut self, len: usize) -> Option<NonNull<u8>> {
        self.allocate(len)
    }

    fn free(&mut self, ptr: NonNull<u8>) -> Result<(), BlockError> {
        unsafe { self.deallocate(ptr) }
    }

    fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        len: usize,
    ) -> Result<Option<NonNull<u8>>, BlockError> {
        unsafe { self.extend(Some(ptr), len) }
    }

    fn counters(&self) -> HeapStats {
        self.stats()
    }
}

/// Drives an arena with a random op sequence, checking that every
/// allocation keeps its contents until it is freed and that the arena
/// returns to an all-free state at the end.
fn run_ops<H: Arena>(heap: &mut H, ops: Vec<ArenaOp>) -> bool {
    let mut allocations: Vec<Allocation> = Vec::new();

    for (seq, op) in ops.into_iter().enumerate() {
        let id = (seq % 251) as u8 + 1;

        match op {
            ArenaOp::Allocate { len } => {
                if let Some(ptr) = heap.alloc(len) {
                    unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) }.fill(id);
                    allocations.push(Allocation { id, ptr, len });
                }
            }

            ArenaOp::Free { index } => {
                if allocations.is_empty() {
                    continue;
                }

                let a = allocations.swap_remove(index % allocations.len());
                let intact = unsafe { slice::from_raw_parts(a.ptr.as_ptr(), a.len) }
                    .iter()
                    .all(|&byte| byte == a.id);
                if !intact || heap.free(a.ptr).is_err() {
                    return false;
                }
            }

            ArenaOp::Extend { index, len } => {
                if allocations.is_empty() || len == 0 {
                    continue;
                }

                let i = index % allocations.len();
                let a = &mut allocations[i];

                match heap.realloc(a.ptr, len) {
                    Ok(Some(q)) => {
                        let keep = a.len.min(len);
                        let intact = unsafe { slice::from_raw_parts(q.as_ptr(), keep) }
                            .iter()
                            .all(|&byte| byte == a.id);
                        if !intact {
                            return false;
                        }

                        unsafe { slice::from_raw_parts_mut(q.as_ptr(), len) }.fill(a.id);
                        a.ptr = q;
                        a.len = len;
                    }
                    // Out of memory: the original allocation is untouched.
                    Ok(None) => {}
                    Err(_) => return false,
                }
            }
        }
    }

    for a in allocations {
        if heap.free(a.ptr).is_err() {
            return false;
        }
    }

    let stats = heap.counters();
    stats.used == 0 && stats.free == stats.total
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<ArenaOp>) -> bool {
        let mut heap = Buddy::try_new(1 << 17, false).unwrap();
        run_ops(&mut heap, ops)
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}

#[test]
fn ffit_allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<ArenaOp>) -> bool {
        let mut heap = FirstFit::try_new(1 << 16).unwrap();
        run_ops(&mut heap, ops)
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}

// -- buddy scenarios -------------------------------------------------------

#[test]
fn buddy_init_stats() {
    let heap = Buddy::try_new(1 << 21, false).unwrap();

    let stats = heap.stats();
    assert_eq!(stats.total, 1 << 20);
    assert_eq!(stats.used, 0);
    assert_eq!(stats.free, 1 << 20);
    assert_eq!(stats.missing(), 0);
}

#[test]
fn buddy_init_rejects_bad_geometry() {
    // Main heap of zero.
    assert!(Buddy::try_new(0, false).is_err());
    // Main heap not a power of two.
    assert!(Buddy::try_new(3 << 20, false).is_err());
    // Too small to fit the bookkeeping.
    assert!(Buddy::try_new(16, false).is_err());
}

#[test]
fn buddy_allocate_rounds_to_size_class() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let _p = heap.allocate(100).unwrap();
    assert_eq!(heap.stats().used, 128);
}

#[test]
fn buddy_allocations_are_disjoint() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(100).unwrap();
    let p2 = heap.allocate(100).unwrap();
    assert_ne!(p, p2);

    let gap = (p2.as_ptr() as usize).abs_diff(p.as_ptr() as usize);
    assert!(gap >= 128);

    unsafe {
        slice::from_raw_parts_mut(p.as_ptr(), 100).fill(0xaa);
        slice::from_raw_parts_mut(p2.as_ptr(), 100).fill(0xbb);
        assert!(slice::from_raw_parts(p.as_ptr(), 100)
            .iter()
            .all(|&b| b == 0xaa));
    }
}

#[test]
fn buddy_free_twice_reports_not_found() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(100).unwrap();
    unsafe {
        assert_eq!(heap.deallocate(p), Ok(()));
        assert_eq!(heap.deallocate(p), Err(BlockError::NotFound));
    }
    assert_eq!(BlockError::NotFound.code(), 4);
    assert_eq!(BlockError::Internal.code(), -1);
}

#[test]
fn buddy_free_coalesces_maximally() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let blocks: Vec<_> = (0..8).map(|_| heap.allocate(4096).unwrap()).collect();
    for p in blocks.into_iter().rev() {
        unsafe { heap.deallocate(p).unwrap() };
    }

    // After freeing everything, the blocks must have merged back far
    // enough that both maximal allocations can be served.
    let big = heap.allocate(1 << 19).unwrap();
    let big2 = heap.allocate(1 << 19).unwrap();
    unsafe {
        heap.deallocate(big).unwrap();
        heap.deallocate(big2).unwrap();
    }
}

#[test]
fn buddy_extend_grows_in_place_when_right_buddies_free() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(100).unwrap();
    unsafe { slice::from_raw_parts_mut(p.as_ptr(), 100) }.fill(0x5a);

    // Everything right of the fresh 128-byte block is free, so the block
    // absorbs its buddies up to 1024 bytes without moving.
    let q = unsafe { heap.extend(Some(p), 1000) }.unwrap().unwrap();
    assert_eq!(q, p);
    assert_eq!(heap.stats().used, 1024);
    assert!(unsafe { slice::from_raw_parts(q.as_ptr(), 100) }
        .iter()
        .all(|&b| b == 0x5a));
}

#[test]
fn buddy_extend_copies_when_buddy_is_used() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(100).unwrap();
    // The second allocation takes the 128-byte buddy of `p`, blocking
    // in-place extension.
    let blocker = heap.allocate(100).unwrap();
    unsafe { slice::from_raw_parts_mut(p.as_ptr(), 100) }.fill(0x17);

    let q = unsafe { heap.extend(Some(p), 1000) }.unwrap().unwrap();
    assert_ne!(q, p);
    assert!(unsafe { slice::from_raw_parts(q.as_ptr(), 100) }
        .iter()
        .all(|&b| b == 0x17));

    // The old block was freed; the next 128-byte request gets it back.
    let reused = heap.allocate(100).unwrap();
    assert_eq!(reused, p);

    let _ = blocker;
}

#[test]
fn buddy_extend_zero_frees() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(100).unwrap();
    let q = unsafe { heap.extend(Some(p), 1000) }.unwrap().unwrap();

    assert_eq!(unsafe { heap.extend(Some(q), 0) }, Ok(None));
    assert_eq!(heap.stats().used, 0);
    assert!(heap.allocate(1000).is_some());
}

#[test]
fn buddy_extend_null_allocates() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = unsafe { heap.extend(None, 100) }.unwrap().unwrap();
    assert_eq!(heap.stats().used, 128);
    unsafe { heap.deallocate(p).unwrap() };
}

#[test]
fn buddy_extend_within_class_returns_pointer_unchanged() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(100).unwrap();
    let before = heap.stats();

    // Both the exact class size and any size rounding to it are identity.
    assert_eq!(unsafe { heap.extend(Some(p), 128) }, Ok(Some(p)));
    assert_eq!(unsafe { heap.extend(Some(p), 100) }, Ok(Some(p)));
    assert_eq!(heap.stats(), before);
}

#[test]
fn buddy_shrink_releases_tail() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(1000).unwrap();
    assert_eq!(heap.stats().used, 1024);
    unsafe { slice::from_raw_parts_mut(p.as_ptr(), 100) }.fill(0x3c);

    let q = unsafe { heap.extend(Some(p), 100) }.unwrap().unwrap();
    assert_eq!(q, p);
    assert_eq!(heap.stats().used, 128);
    assert!(unsafe { slice::from_raw_parts(q.as_ptr(), 100) }
        .iter()
        .all(|&b| b == 0x3c));

    // The released tail serves new requests.
    assert!(heap.allocate(512).is_some());
    assert_eq!(heap.stats().used, 128 + 512);
}

#[test]
fn buddy_rejects_zero_and_oversize_requests() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    assert!(heap.allocate(0).is_none());
    // The main heap is 2^20; only requests of at least that size are
    // rejected outright.
    assert!(heap.allocate(1 << 20).is_none());

    // Anything smaller is served, even when it rounds up to the single
    // block spanning the whole main heap.
    let p = heap.allocate((1 << 20) - 1).unwrap();
    assert_eq!(heap.stats().used, 1 << 20);
    unsafe { heap.deallocate(p).unwrap() };

    let p = heap.allocate((1 << 19) + 1).unwrap();
    assert_eq!(heap.stats().used, 1 << 20);
    unsafe { heap.deallocate(p).unwrap() };

    assert_eq!(heap.stats().used, 0);
}

#[test]
fn buddy_deallocate_rejects_stray_pointers() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();

    let p = heap.allocate(100).unwrap();

    unsafe {
        // Not aligned to the minimal block.
        let inner = NonNull::new(p.as_ptr().wrapping_add(4)).unwrap();
        assert_eq!(heap.deallocate(inner), Err(BlockError::NotFound));

        // Aligned, but no block starts there.
        let inner = NonNull::new(p.as_ptr().wrapping_add(8)).unwrap();
        assert_eq!(heap.deallocate(inner), Err(BlockError::NotFound));

        // Below the region.
        let below = NonNull::new(p.as_ptr().wrapping_sub(1)).unwrap();
        assert_eq!(heap.deallocate(below), Err(BlockError::NotFound));

        heap.deallocate(p).unwrap();
    }
}

#[test]
fn buddy_emergency_takes_over_on_exhaustion() {
    let mut heap = Buddy::try_new(1 << 21, true).unwrap();

    let a = heap.allocate(1 << 19).unwrap();
    let b = heap.allocate(1 << 19).unwrap();

    // The main heap is exhausted; the next request lands in the
    // emergency region, which starts one main-heap size above `a`.
    let e = heap.allocate(1000).unwrap();
    let offset = e.as_ptr() as usize - a.as_ptr() as usize;
    assert!(offset >= 1 << 20);

    let emergency = heap.emergency().unwrap().stats();
    assert_eq!(emergency.used, 1005);

    unsafe {
        // Frees route by pointer range.
        heap.deallocate(e).unwrap();
        assert_eq!(heap.deallocate(e), Err(BlockError::NotFound));

        heap.deallocate(a).unwrap();
        heap.deallocate(b).unwrap();
    }
    assert_eq!(heap.stats().used, 0);
}

#[test]
fn buddy_extend_routes_to_emergency() {
    let mut heap = Buddy::try_new(1 << 21, true).unwrap();

    let a = heap.allocate(1 << 19).unwrap();
    let _b = heap.allocate(1 << 19).unwrap();

    let e = heap.allocate(1000).unwrap();
    unsafe { slice::from_raw_parts_mut(e.as_ptr(), 1000) }.fill(0x42);

    let q = unsafe { heap.extend(Some(e), 2000) }.unwrap().unwrap();
    let offset = q.as_ptr() as usize - a.as_ptr() as usize;
    assert!(offset >= 1 << 20);
    assert!(unsafe { slice::from_raw_parts(q.as_ptr(), 1000) }
        .iter()
        .all(|&byte| byte == 0x42));
}

#[test]
fn buddy_new_raw_over_caller_region() {
    let mut backing = vec![0u8; 1 << 13];
    let region = NonNull::new(backing.as_mut_ptr()).unwrap();

    let mut heap = unsafe { Buddy::new_raw(region, 1 << 13, true) }.unwrap();
    let p = heap.allocate(64).unwrap();
    unsafe { heap.deallocate(p).unwrap() };

    let returned = unsafe { heap.into_raw_parts() };
    assert_eq!(returned.as_ptr(), backing.as_mut_ptr());
}

#[test]
fn buddy_heap_map_renders_tokens_and_totals() {
    let mut heap = Buddy::try_new(1 << 21, false).unwrap();
    let _p = heap.allocate(100).unwrap();

    let rendered = format!("{}", heap.heap_map());
    // A red used token, a green free token, and the totals.
    assert!(rendered.contains("\u{1b}[31m128\u{1b}[0m|"));
    assert!(rendered.contains("\u{1b}[32m"));
    assert!(rendered.contains("Total    : 001048576"));
    assert!(!rendered.contains("missing"));
}

#[test]
fn buddy_heap_map_includes_emergency_section() {
    let heap = Buddy::try_new(1 << 21, true).unwrap();

    let rendered = format!("{}", heap.heap_map());
    assert!(rendered.contains("### EMERGENCY"));
}

// -- first-fit scenarios ---------------------------------------------------

#[test]
fn ffit_init_requires_viable_region() {
    assert!(FirstFit::try_new(32).is_err());
    assert!(FirstFit::try_new(33).is_ok());
}

#[test]
fn ffit_small_allocation_uses_min_block() {
    let mut heap = FirstFit::try_new(1 << 20).unwrap();

    let p = heap.allocate(27).unwrap();
    let stats = heap.stats();
    assert_eq!(stats.total, 1 << 20);
    assert_eq!(stats.used, 32);

    unsafe {
        assert_eq!(heap.deallocate(p), Ok(()));
        assert_eq!(heap.deallocate(p), Err(BlockError::NotFound));
    }

    let stats = heap.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.free, 1 << 20);
}

#[test]
fn ffit_allocations_are_disjoint() {
    let mut heap = FirstFit::try_new(1 << 16).unwrap();

    let p = heap.allocate(100).unwrap();
    let q = heap.allocate(100).unwrap();
    assert_ne!(p, q);

    unsafe {
        slice::from_raw_parts_mut(p.as_ptr(), 100).fill(0xaa);
        slice::from_raw_parts_mut(q.as_ptr(), 100).fill(0xbb);
        assert!(slice::from_raw_parts(p.as_ptr(), 100)
            .iter()
            .all(|&b| b == 0xaa));
    }
}

#[test]
fn ffit_free_coalesces_with_both_neighbours() {
    let mut heap = FirstFit::try_new(1 << 20).unwrap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let c = heap.allocate(100).unwrap();

    unsafe {
        heap.deallocate(a).unwrap();
        heap.deallocate(c).unwrap();
        heap.deallocate(b).unwrap();
    }

    // Everything must have merged back into a single block.
    let stats = heap.stats();
    assert_eq!(stats.free, 1 << 20);
    assert!(heap.allocate((1 << 20) - 6).is_some());
}

#[test]
fn ffit_split_only_when_worthwhile() {
    let heap_size = 1 << 16;
    let mut heap = FirstFit::try_new(heap_size).unwrap();

    // The residual of 16 bytes is below the minimal block, so the whole
    // region is consumed as slack.
    let p = heap.allocate(heap_size - 5 - 16).unwrap();
    assert_eq!(heap.stats().used, heap_size as u32);

    unsafe { heap.deallocate(p).unwrap() };
}

#[test]
fn ffit_extend_identity_and_laws() {
    let mut heap = FirstFit::try_new(1 << 16).unwrap();

    // extend(None, n) behaves like allocate.
    let p = unsafe { heap.extend(None, 27) }.unwrap().unwrap();
    assert_eq!(heap.stats().used, 32);

    // A request with the same effective size returns the pointer
    // unchanged.
    assert_eq!(unsafe { heap.extend(Some(p), 27) }, Ok(Some(p)));

    // extend(p, 0) frees.
    assert_eq!(unsafe { heap.extend(Some(p), 0) }, Ok(None));
    assert_eq!(heap.stats().used, 0);
}

#[test]
fn ffit_extend_copies_payload() {
    let mut heap = FirstFit::try_new(1 << 16).unwrap();

    let p = heap.allocate(40).unwrap();
    unsafe { slice::from_raw_parts_mut(p.as_ptr(), 40) }.fill(0x77);

    let q = unsafe { heap.extend(Some(p), 200) }.unwrap().unwrap();
    assert_ne!(q, p);
    assert!(unsafe { slice::from_raw_parts(q.as_ptr(), 40) }
        .iter()
        .all(|&b| b == 0x77));

    // Shrinking also moves, preserving the prefix.
    unsafe { slice::from_raw_parts_mut(q.as_ptr(), 200) }.fill(0x78);
    let r = unsafe { heap.extend(Some(q), 40) }.unwrap().unwrap();
    assert!(unsafe { slice::from_raw_parts(r.as_ptr(), 40) }
        .iter()
        .all(|&b| b == 0x78));
}

#[test]
fn ffit_extend_oom_preserves_original() {
    let mut heap = FirstFit::try_new(1 << 10).unwrap();

    let p = heap.allocate(100).unwrap();
    unsafe { slice::from_raw_parts_mut(p.as_ptr(), 100) }.fill(0x66);

    // Far beyond the region: fails without touching the block.
    assert_eq!(unsafe { heap.extend(Some(p), 2000) }, Ok(None));
    // Within the region but not serviceable next to the live block.
    assert_eq!(unsafe { heap.extend(Some(p), 950) }, Ok(None));

    assert!(unsafe { slice::from_raw_parts(p.as_ptr(), 100) }
        .iter()
        .all(|&b| b == 0x66));
    unsafe { heap.deallocate(p).unwrap() };
}

#[test]
fn ffit_new_raw_over_caller_region() {
    let mut backing = vec![0u8; 4096];
    let region = NonNull::new(backing.as_mut_ptr()).unwrap();

    let mut heap = unsafe { FirstFit::new_raw(region, 4096) }.unwrap();
    let p = heap.allocate(64).unwrap();
    unsafe { heap.deallocate(p).unwrap() };

    let returned = unsafe { heap.into_raw_parts() };
    assert_eq!(returned.as_ptr(), backing.as_mut_ptr());
}

#[test]
fn ffit_heap_map_renders_tokens_and_totals() {
    let mut heap = FirstFit::try_new(1 << 16).unwrap();
    let _p = heap.allocate(27).unwrap();

    let rendered = format!("{}", heap.heap_map());
    assert!(rendered.contains("\u{1b}[31m32\u{1b}[0m|"));
    assert!(rendered.contains("\u{1b}[32m65504\u{1b}[0m|"));
    assert!(rendered.contains("Total    : 000065536"));
}
