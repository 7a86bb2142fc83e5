//! A first-fit arena.
//!
//! The region is managed as a sequence of adjacent, self-describing blocks
//! (after Knuth, Vol. 1, §2.5). Each block carries a 32-bit word holding
//! `(size << 1) | tag` at its start and a one-byte copy of the tag at its
//! end, where `size` is the total block length and `tag` is set while the
//! block is handed out:
//!
//! ```text
//!   +----+----+----+-------------+-+
//!   |    |    |    | ...         | |
//!   +----+----+----+-------------+-+
//!   ^    ^    ^    ^             ^
//!   |    |    |    |             '- trailer tag (1 byte)
//!   |    |    |    '- payload continues
//!   |    |    '- prev link (4 bytes, free blocks only)
//!   |    '- next link (4 bytes, free blocks only); payload starts here
//!   '- size and tag (4 bytes)
//! ```
//!
//! The links are needed only while a block is free, so the per-allocation
//! overhead is the 5 bytes of header word and trailer tag. Free blocks form
//! a doubly-linked list ordered by ascending size; an allocation takes the
//! first (and therefore smallest) sufficient block. Freeing coalesces with
//! both neighbours, found via the preceding block's trailer tag and the
//! following block's header.
//!
//! Unlike the [buddy arena](crate::buddy), a stray write into a block
//! header corrupts the allocator, and a stray pointer passed to
//! [`deallocate`](FirstFit::deallocate) is only detected on a best-effort
//! basis. The buddy arena's out-of-band size area makes it the more robust
//! of the two.

use core::{alloc::Layout, fmt, mem::ManuallyDrop, ptr::NonNull};

use crate::{
    decode, encode,
    report::{self, HeapStats},
    AllocInitError, BackingAllocator, BasePtr, BlockError, Raw, NO_BLOCK,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The minimal block size.
///
/// Chosen so that the 13 bytes of header, links and trailer always fit,
/// and so that the fixed 5-byte overhead stays below ~15% of the smallest
/// block.
const MIN_BLOCK: u32 = 32;

/// Size of the header word; also the offset of the payload (and of the
/// `next` link) within a block.
const HEADER: u32 = 4;

/// Per-block overhead: header word plus trailer tag.
const OVERHEAD: u32 = 5;

/// Computes the total block size needed to serve a request of `size`
/// bytes, or `None` if it cannot be represented.
fn effective_size(size: usize) -> Option<u32> {
    let s = u32::try_from(size).ok()?.checked_add(OVERHEAD)?;
    Some(s.max(MIN_BLOCK))
}

/// A first-fit arena.
pub struct FirstFit<A: BackingAllocator> {
    base: BasePtr,
    size: u32,
    first: Option<u32>,
    last: Option<u32>,
    layout: Layout,
    backing_allocator: A,
}

impl FirstFit<Raw> {
    /// Constructs a new `FirstFit` arena from a raw pointer.
    ///
    /// The arena never frees the region; reclaim it with
    /// [`into_raw_parts`](FirstFit::into_raw_parts).
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is 32 bytes or less, if `size` exceeds
    /// 2 GiB, or if the region would wrap the address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and
    /// the memory must not be accessed except through the arena while the
    /// arena exists.
    pub unsafe fn new_raw(region: NonNull<u8>, size: usize) -> Result<FirstFit<Raw>, AllocInitError> {
        let layout = Layout::from_size_align(size, 1).map_err(|_| AllocInitError::InvalidConfig)?;

        unsafe { RawFirstFit::try_new(region, layout).map(|raw| raw.with_backing_allocator(Raw)) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl FirstFit<Global> {
    /// Attempts to construct a new `FirstFit` arena backed by the global
    /// allocator.
    ///
    /// The managed region of `size` bytes is obtained from the global
    /// allocator and returned to it on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is invalid (see
    /// [`new_raw`](FirstFit::new_raw)) or if the global allocator fails.
    pub fn try_new(size: usize) -> Result<FirstFit<Global>, AllocInitError> {
        if size <= MIN_BLOCK as usize {
            return Err(AllocInitError::InvalidConfig);
        }

        let layout = Layout::from_size_align(size, 8).map_err(|_| AllocInitError::InvalidConfig)?;

        unsafe {
            let raw = alloc::alloc::alloc(layout);
            let region = NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))?;

            match RawFirstFit::try_new(region, layout) {
                Ok(parts) => Ok(parts.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> FirstFit<A> {
    /// Attempts to allocate a block of `size` bytes.
    ///
    /// The returned pointer has no alignment guarantee beyond byte
    /// alignment. Returns `None` if `size` is zero or if no free block is
    /// large enough.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let s = effective_size(size).filter(|&s| s < self.size)?;
        let b = self.take_block(s)?;

        Some(self.base.with_offset(b + HEADER).unwrap())
    }

    /// Deallocates the block at `ptr`, coalescing it with free neighbours.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::NotFound`] if `ptr` does not lie in the
    /// region or the addressed block is not currently allocated (e.g. a
    /// double free). Detection of stray pointers into the middle of a
    /// block is best-effort only. Returns [`BlockError::Internal`] if
    /// coalescing uncovers a corrupted free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](FirstFit::allocate)
    /// or [`extend`](FirstFit::extend) on this arena, and the block's
    /// header and trailer bytes must not have been overwritten.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), BlockError> {
        let offset = self.base.offset_of(ptr).ok_or(BlockError::NotFound)?;
        if offset < HEADER as usize || offset >= self.size as usize {
            return Err(BlockError::NotFound);
        }

        self.free_at(offset as u32 - HEADER)
    }

    /// Re-allocates the block at `ptr` to `size` bytes.
    ///
    /// - `ptr == None` is equivalent to [`allocate`](FirstFit::allocate).
    /// - `size == 0` is equivalent to [`deallocate`](FirstFit::deallocate)
    ///   and yields `Ok(None)`.
    /// - Otherwise a block of the new size is allocated, the payload is
    ///   copied, and the old block is freed. `Ok(None)` is returned if no
    ///   block can serve the new size; the original block is untouched.
    ///
    /// This arena does not grow blocks in place; only a request whose
    /// effective size equals the current block size returns the input
    /// pointer unchanged.
    ///
    /// # Errors
    ///
    /// As for [`deallocate`](FirstFit::deallocate).
    ///
    /// # Safety
    ///
    /// As for [`deallocate`](FirstFit::deallocate).
    pub unsafe fn extend(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, BlockError> {
        let Some(ptr) = ptr else {
            return Ok(self.allocate(size));
        };

        if size == 0 {
            unsafe { self.deallocate(ptr)? };
            return Ok(None);
        }

        let offset = self.base.offset_of(ptr).ok_or(BlockError::NotFound)?;
        if offset < HEADER as usize || offset >= self.size as usize {
            return Err(BlockError::NotFound);
        }
        let b = offset as u32 - HEADER;

        let Some(s) = effective_size(size).filter(|&s| s < self.size) else {
            return Ok(None);
        };

        let (old_size, tag) = self.size_tag(b);
        if !tag || old_size < MIN_BLOCK || old_size > self.size - b {
            return Err(BlockError::NotFound);
        }

        if old_size == s {
            return Ok(Some(ptr));
        }

        let Some(nb) = self.take_block(s) else {
            return Ok(None);
        };

        let count = (old_size - OVERHEAD).min(size as u32);
        unsafe {
            self.base
                .copy_nonoverlapping(b + HEADER, nb + HEADER, count as usize);
        }
        self.free_at(b)?;

        Ok(Some(self.base.with_offset(nb + HEADER).unwrap()))
    }

    /// Computes the current byte counters with a linear walk over all
    /// blocks.
    pub fn stats(&self) -> HeapStats {
        let (stats, lost) = self.scan();
        if let Some(at) = lost {
            log::warn!("first-fit walk aborted: corrupt block at offset {}", at);
        }
        stats
    }

    /// Returns a [`Display`](core::fmt::Display) adapter rendering the
    /// block structure: one colored size token per block (red used, green
    /// free) followed by the totals.
    pub fn heap_map(&self) -> HeapMap<'_, A> {
        HeapMap { heap: self }
    }

    /// Decomposes the arena into the pointer to its region.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned pointer becomes the sole owner of the region.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        let this = ManuallyDrop::new(self);
        this.base.ptr()
    }

    /// Finds the first (smallest) sufficient free block, splits off any
    /// worthwhile remainder, and tags the block. Returns its offset.
    fn take_block(&mut self, s: u32) -> Option<u32> {
        let mut cur = self.first;

        while let Some(p) = cur {
            let psize = self.block_size(p);
            if psize >= s {
                self.remove(p);

                if psize > s + MIN_BLOCK {
                    // Split off the tail as a new free block; a smaller
                    // remainder stays as slack inside the allocation.
                    let q = p + s;
                    self.write_header(p, s, false);
                    self.write_header(q, psize - s, false);
                    self.write_trailer(q, psize - s, false);
                    self.insert_sorted(q);
                }

                self.tag_block(p);
                return Some(p);
            }

            cur = self.next_of(p);
        }

        None
    }

    /// Frees the block at offset `b`, coalescing with both neighbours.
    fn free_at(&mut self, b: u32) -> Result<(), BlockError> {
        let (s, tag) = self.size_tag(b);
        if !tag || s < MIN_BLOCK || s > self.size - b {
            return Err(BlockError::NotFound);
        }

        let end = b + s;
        let mut blk = b;

        // The byte before the block is the preceding neighbour's trailer.
        if b > 0 && !self.tagged(b - 1) {
            // The size-ordered list carries no address information, so the
            // predecessor is found by matching its extent against `b`.
            let p = self.find_pred(b).ok_or(BlockError::Internal)?;
            let merged = self.block_size(p) + s;
            self.remove(p);
            self.write_header(p, merged, false);
            blk = p;
        }

        if end + HEADER <= self.size {
            let (qs, qtag) = self.size_tag(end);
            if !qtag {
                self.remove(end);
                let merged = self.block_size(blk) + qs;
                self.write_header(blk, merged, false);
            }
        }

        self.untag_block(blk);
        self.insert_sorted(blk);

        Ok(())
    }

    /// Walks the block partition, accumulating byte counters. The second
    /// component is the offset at which the walk had to stop, if the
    /// partition is corrupt.
    fn scan(&self) -> (HeapStats, Option<u32>) {
        let mut stats = HeapStats {
            total: self.size,
            used: 0,
            free: 0,
        };

        let mut b = 0;
        while b < self.size {
            let (s, tag) = self.size_tag(b);
            if s < MIN_BLOCK || s > self.size - b {
                return (stats, Some(b));
            }

            if tag {
                stats.used += s;
            } else {
                stats.free += s;
            }
            b += s;
        }

        (stats, None)
    }

    // -- block accessors ---------------------------------------------------
    //
    // All offsets handed to these come from the arena's own bookkeeping and
    // are in bounds for the region by the block layout invariants.

    #[inline]
    fn size_tag(&self, b: u32) -> (u32, bool) {
        let word = unsafe { self.base.read_u32(b) };
        (word >> 1, word & 1 == 1)
    }

    #[inline]
    fn block_size(&self, b: u32) -> u32 {
        self.size_tag(b).0
    }

    #[inline]
    fn write_header(&mut self, b: u32, size: u32, tag: bool) {
        unsafe { self.base.write_u32(b, (size << 1) | tag as u32) };
    }

    #[inline]
    fn write_trailer(&mut self, b: u32, size: u32, tag: bool) {
        unsafe { self.base.write_u8(b + size - 1, tag as u8) };
    }

    /// Reads the tag byte at `at` (the low bit is authoritative).
    #[inline]
    fn tagged(&self, at: u32) -> bool {
        (unsafe { self.base.read_u8(at) } & 1) == 1
    }

    fn tag_block(&mut self, b: u32) {
        let size = self.block_size(b);
        self.write_header(b, size, true);
        self.write_trailer(b, size, true);
    }

    fn untag_block(&mut self, b: u32) {
        let size = self.block_size(b);
        self.write_header(b, size, false);
        self.write_trailer(b, size, false);
    }

    #[inline]
    fn next_of(&self, b: u32) -> Option<u32> {
        decode(unsafe { self.base.read_u32(b + HEADER) })
    }

    #[inline]
    fn prev_of(&self, b: u32) -> Option<u32> {
        decode(unsafe { self.base.read_u32(b + 2 * HEADER) })
    }

    #[inline]
    fn set_next(&mut self, b: u32, link: Option<u32>) {
        unsafe { self.base.write_u32(b + HEADER, encode(link)) };
    }

    #[inline]
    fn set_prev(&mut self, b: u32, link: Option<u32>) {
        unsafe { self.base.write_u32(b + 2 * HEADER, encode(link)) };
    }

    // -- avail list --------------------------------------------------------
    //
    // Invariant: `last` is `None` exactly when `first` is `None`; both ends
    // are maintained by every mutation.

    /// Unlinks the free block at `b` from the avail list.
    fn remove(&mut self, b: u32) {
        let next = self.next_of(b);
        let prev = self.prev_of(b);

        match prev {
            Some(p) => self.set_next(p, next),
            None => self.first = next,
        }
        match next {
            Some(n) => self.set_prev(n, prev),
            None => self.last = prev,
        }
    }

    /// Links the free block at `q` into the avail list immediately before
    /// `p`.
    fn insert_before(&mut self, p: u32, q: u32) {
        let prev = self.prev_of(p);
        match prev {
            Some(pp) => self.set_next(pp, Some(q)),
            None => self.first = Some(q),
        }
        self.set_prev(q, prev);
        self.set_prev(p, Some(q));
        self.set_next(q, Some(p));
    }

    /// Links the free block at `b` into the avail list at its position in
    /// the ascending size order.
    fn insert_sorted(&mut self, b: u32) {
        let size = self.block_size(b);

        let Some(head) = self.first else {
            self.first = Some(b);
            self.last = Some(b);
            self.set_next(b, None);
            self.set_prev(b, None);
            return;
        };

        let mut p = head;
        loop {
            if self.block_size(p) >= size {
                self.insert_before(p, b);
                return;
            }

            match self.next_of(p) {
                Some(n) => p = n,
                None => {
                    self.set_next(p, Some(b));
                    self.set_prev(b, Some(p));
                    self.set_next(b, None);
                    self.last = Some(b);
                    return;
                }
            }
        }
    }

    /// Finds the free block whose extent ends exactly at `end`.
    fn find_pred(&self, end: u32) -> Option<u32> {
        let mut cur = self.first;
        while let Some(p) = cur {
            if p + self.block_size(p) == end {
                return Some(p);
            }
            cur = self.next_of(p);
        }
        None
    }
}

impl<A: BackingAllocator> Drop for FirstFit<A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), self.layout)
        };
    }
}

impl<A: BackingAllocator> fmt::Debug for FirstFit<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirstFit")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("first", &self.first)
            .field("last", &self.last)
            .finish()
    }
}

/// A rendered view of a [`FirstFit`] arena's block structure.
///
/// Produced by [`FirstFit::heap_map`]; the [`Display`](core::fmt::Display)
/// impl writes one colored token per block followed by the totals.
pub struct HeapMap<'a, A: BackingAllocator> {
    heap: &'a FirstFit<A>,
}

impl<A: BackingAllocator> fmt::Display for HeapMap<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap;
        let mut stats = HeapStats {
            total: heap.size,
            used: 0,
            free: 0,
        };

        let mut b = 0;
        while b < heap.size {
            let (s, tag) = heap.size_tag(b);
            if s < MIN_BLOCK || s > heap.size - b {
                break;
            }

            report::write_block(f, s, tag)?;
            if tag {
                stats.used += s;
            } else {
                stats.free += s;
            }
            b += s;
        }

        report::write_totals(f, &stats)
    }
}

impl<A: BackingAllocator> fmt::Debug for HeapMap<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapMap").finish_non_exhaustive()
    }
}

/// Like a `FirstFit`, but without a `Drop` impl or an associated backing
/// allocator.
///
/// This assists in tacking on the allocator type parameter, because this
/// struct can be moved out of while `FirstFit` itself cannot.
struct RawFirstFit {
    base: BasePtr,
    size: u32,
    layout: Layout,
}

impl RawFirstFit {
    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> FirstFit<A> {
        FirstFit {
            base: self.base,
            size: self.size,
            first: Some(0),
            last: Some(0),
            layout: self.layout,
            backing_allocator,
        }
    }

    /// Initializes a first-fit heap over `region`.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `layout.size()`
    /// bytes.
    unsafe fn try_new(region: NonNull<u8>, layout: Layout) -> Result<RawFirstFit, AllocInitError> {
        let size = layout.size();
        if size <= MIN_BLOCK as usize || size >= (1 << 31) {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = BasePtr::new(region, size)?;
        let size = size as u32;

        // The entire region starts out as a single untagged block.
        unsafe {
            base.write_u32(0, size << 1);
            base.write_u32(HEADER, NO_BLOCK);
            base.write_u32(2 * HEADER, NO_BLOCK);
            base.write_u8(size - 1, 0);
        }

        Ok(RawFirstFit { base, size, layout })
    }
}
