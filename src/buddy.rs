//! A binary-buddy arena.
//!
//! Memory blocks are handed out in power-of-two sizes from 8 bytes up
//! (after Knuth, Vol. 1, §2.5). The backing region is split into two
//! halves: the first (whose size must be a power of two) is the buddy
//! managed main heap, the second hosts the bookkeeping structures and an
//! optional first-fit *emergency heap* used when the main heap cannot
//! satisfy a request:
//!
//! ```text
//!     +---------------+--------+--+----+
//!     |               |        |  |    |
//!     +---------------+--------+--+----+
//!     ^               ^        ^  ^
//!     |               |        |  '- size area
//!     |               |        '- avail table
//!     |               '- emergency heap
//!     '- main heap
//! ```
//!
//! The bookkeeping is two structures. The *avail table* holds one list
//! head per size class 2^k; the lists themselves live inside the free
//! blocks as pairs of 32-bit offsets, which is why freshly managed memory
//! is filled with `0xFF` (the no-block pattern). The *size area* records
//! 6 bits per 8-byte unit: the class of the live block starting there, or
//! zero. Remembering sizes out of band lets the arena reject stray frees
//! cheaply, find the right avail list without searching, and locate a
//! block's *buddy* (the equally-sized neighbour it merges with) by pure
//! address arithmetic.
//!
//! Splitting on allocation and maximal re-joining on free keep the largest
//! possible blocks available; a block of size 2^k at offset `b` has its
//! buddy at `b XOR 2^k`.

use core::{alloc::Layout, fmt, mem::ManuallyDrop, ptr::NonNull};

use crate::{
    decode, encode,
    ffit::FirstFit,
    report::{self, HeapStats},
    sizemap::SizeMap,
    AllocInitError, BackingAllocator, BasePtr, BlockError, Raw, NO_BLOCK,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The minimal allocation size, which is also the unit of the size area
/// and the required alignment of every block offset.
const MIN_BLOCK: u32 = 8;

/// Computes the power-of-two block size serving a request of `size`
/// bytes, or `None` if it cannot be represented.
fn effective_size(size: usize) -> Option<u32> {
    let sz = u32::try_from(size).ok()?;
    if sz < MIN_BLOCK {
        Some(MIN_BLOCK)
    } else {
        sz.checked_next_power_of_two()
    }
}

/// Returns the offset of the buddy of the block at `b` of size class `k`.
///
/// The buddy is the block `b` was split from or may merge with: `b + 2^k`
/// when `b` is aligned to `2^(k+1)`, and `b - 2^k` otherwise.
fn find_buddy(b: u32, k: u8) -> u32 {
    let size = 1u32 << k;
    if b & ((size << 1) - 1) == 0 {
        b + size
    } else {
        b - size
    }
}

/// A binary-buddy arena, optionally composed with an embedded first-fit
/// emergency heap.
pub struct Buddy<A: BackingAllocator> {
    base: BasePtr,
    heap_size: u32,
    main_size: u32,
    amax: u8,
    /// Offset of the avail table; also the end of the emergency region.
    avail_ofs: u32,
    size_map: SizeMap,
    emergency: Option<FirstFit<Raw>>,
    layout: Layout,
    backing_allocator: A,
}

impl Buddy<Raw> {
    /// Constructs a new `Buddy` arena from a raw pointer.
    ///
    /// Half of the region becomes the buddy-managed main heap; the other
    /// half hosts the bookkeeping and, if `emergency` is set, an embedded
    /// [`FirstFit`] arena that serves requests the main heap cannot.
    ///
    /// The arena never frees the region; reclaim it with
    /// [`into_raw_parts`](Buddy::into_raw_parts).
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or exceeds 4 GiB, if `size / 2`
    /// is not a power of two, if the bookkeeping does not fit beside the
    /// main heap, or if the emergency sub-arena cannot be initialized.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes, and
    /// the memory must not be accessed except through the arena while the
    /// arena exists.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        size: usize,
        emergency: bool,
    ) -> Result<Buddy<Raw>, AllocInitError> {
        let layout = Layout::from_size_align(size, 1).map_err(|_| AllocInitError::InvalidConfig)?;

        unsafe {
            RawBuddy::try_new(region, layout, emergency)
                .map(|raw| raw.with_backing_allocator(Raw))
        }
    }
}

#[cfg(any(feature = "alloc", test))]
impl Buddy<Global> {
    /// Attempts to construct a new `Buddy` arena backed by the global
    /// allocator.
    ///
    /// The managed region of `size` bytes is obtained from the global
    /// allocator and returned to it on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is invalid (see
    /// [`new_raw`](Buddy::new_raw)) or if the global allocator fails.
    pub fn try_new(size: usize, emergency: bool) -> Result<Buddy<Global>, AllocInitError> {
        if size == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let layout =
            Layout::from_size_align(size, MIN_BLOCK as usize).map_err(|_| AllocInitError::InvalidConfig)?;

        unsafe {
            let raw = alloc::alloc::alloc(layout);
            let region = NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))?;

            match RawBuddy::try_new(region, layout, emergency) {
                Ok(parts) => Ok(parts.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> Buddy<A> {
    /// Attempts to allocate a block of `size` bytes.
    ///
    /// The granted block is the next power of two of `size`, at least 8
    /// bytes, and is aligned to its own size within the region. Returns
    /// `None` if `size` is zero or at least the main heap size, or if
    /// neither the main heap nor the emergency heap (if any) can serve
    /// the request.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size >= self.main_size as usize {
            return None;
        }

        let s = effective_size(size)?;
        let k = s.ilog2() as u8;

        match self.take_block(k) {
            Some(b) => Some(self.base.with_offset(b).unwrap()),
            None => self.emergency.as_mut()?.allocate(size),
        }
    }

    /// Deallocates the block at `ptr`, re-joining it with its buddies as
    /// far as possible.
    ///
    /// Pointers into the emergency region are routed to the embedded
    /// first-fit arena.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::NotFound`] if `ptr` does not lie in the
    /// managed region, is not aligned to the minimal block, or does not
    /// address a live block (e.g. a double free). Returns
    /// [`BlockError::Internal`] if the emergency arena detects corruption.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Buddy::allocate) or
    /// [`extend`](Buddy::extend) on this arena.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), BlockError> {
        let offset = self.base.offset_of(ptr).ok_or(BlockError::NotFound)?;

        // The bookkeeping structures above the emergency region are not
        // addressable by callers.
        if offset >= self.avail_ofs as usize {
            return Err(BlockError::NotFound);
        }

        if offset >= self.main_size as usize {
            let ff = self.emergency.as_mut().ok_or(BlockError::NotFound)?;
            return unsafe { ff.deallocate(ptr) };
        }

        self.free_block(offset as u32)
    }

    /// Re-allocates the block at `ptr` to `size` bytes.
    ///
    /// - `ptr == None` is equivalent to [`allocate`](Buddy::allocate).
    /// - `size == 0` is equivalent to [`deallocate`](Buddy::deallocate)
    ///   and yields `Ok(None)`.
    /// - A request within the block's current size class returns `ptr`
    ///   unchanged.
    /// - Growing first tries to absorb the free buddies to the right of
    ///   the block; failing that, a fresh block is allocated, the payload
    ///   copied, and the old block freed. `Ok(None)` is returned if no
    ///   block can serve the new size; the original block is untouched.
    /// - Shrinking is done in place; the tail is released back to the
    ///   avail lists.
    ///
    /// Pointers into the emergency region are routed to the embedded
    /// first-fit arena.
    ///
    /// # Errors
    ///
    /// As for [`deallocate`](Buddy::deallocate).
    ///
    /// # Safety
    ///
    /// As for [`deallocate`](Buddy::deallocate).
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
        if offset >= self.heap_size as usize {
            return Err(BlockError::NotFound);
        }

        if offset >= self.main_size as usize {
            let ff = self.emergency.as_mut().ok_or(BlockError::NotFound)?;
            return unsafe { ff.extend(Some(ptr), size) };
        }

        if size >= self.main_size as usize {
            return Ok(None);
        }
        let Some(s) = effective_size(size) else {
            return Ok(None);
        };

        match self.extend_block(offset as u32, s)? {
            Some(nb) => Ok(Some(self.base.with_offset(nb).unwrap())),
            None => Ok(None),
        }
    }

    /// Computes the current byte counters of the main heap with a linear
    /// walk over all blocks.
    ///
    /// The emergency heap keeps its own statistics; see
    /// [`emergency`](Buddy::emergency).
    pub fn stats(&self) -> HeapStats {
        let (stats, lost) = self.scan();
        if let Some(at) = lost {
            log::warn!("buddy walk aborted: lost block at offset {}", at);
        }
        stats
    }

    /// Returns a reference to the embedded emergency arena, if the arena
    /// was created with one.
    pub fn emergency(&self) -> Option<&FirstFit<Raw>> {
        self.emergency.as_ref()
    }

    /// Returns a [`Display`](core::fmt::Display) adapter rendering the
    /// block structure: one colored size token per block (red used, green
    /// free) followed by the totals, and the emergency heap's map when
    /// present.
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

    /// Takes a block of class `k` off the avail lists, splitting a larger
    /// block down if necessary, and records its size.
    fn take_block(&mut self, k: u8) -> Option<u32> {
        let mut i = k;
        while i <= self.amax && self.avail_head(i).is_none() {
            i += 1;
        }
        if i > self.amax {
            return None;
        }

        while i > k {
            let b = self.avail_head(i)?;
            self.split(b, i);
            i -= 1;
        }

        let b = self.avail_head(k)?;
        let unit = (b / MIN_BLOCK) as usize;
        debug_assert_eq!(self.size_map.get(unit), 0);

        self.remove_avail(k, b);
        self.size_map.put(unit, k);

        Some(b)
    }

    /// Frees the block at offset `b`, re-joining buddies as far as
    /// possible.
    fn free_block(&mut self, b: u32) -> Result<(), BlockError> {
        if b % MIN_BLOCK != 0 {
            return Err(BlockError::NotFound);
        }

        let unit = (b / MIN_BLOCK) as usize;
        let k = self.size_map.get(unit);
        if k == 0 || k > self.amax {
            // No live block starts here; either never allocated or
            // already freed.
            return Err(BlockError::NotFound);
        }

        self.size_map.erase(unit);
        if !self.join(b, k) {
            self.insert_avail(k, b);
        }

        Ok(())
    }

    /// Splits the free block at `b` of class `k` into its two halves.
    fn split(&mut self, b: u32, k: u8) {
        self.remove_avail(k, b);
        let half = 1u32 << (k - 1);
        self.insert_avail(k - 1, b + half);
        self.insert_avail(k - 1, b);
    }

    /// Repeatedly joins the block at `add` of class `k` with its buddy,
    /// moving the result one class up each time. Returns whether at least
    /// one join happened; if not, the caller still owns the block.
    fn join(&mut self, add: u32, k: u8) -> bool {
        let mut merged = false;
        let mut b = add;

        for j in k..self.amax {
            let buddy = find_buddy(b, j);
            if !self.is_avail(j, buddy) {
                break;
            }

            self.remove_avail(j, buddy);
            if merged {
                self.remove_avail(j, b);
            }
            b = b.min(buddy);
            self.insert_avail(j + 1, b);
            merged = true;
        }

        merged
    }

    /// Re-allocates the main-heap block at `b` to the power-of-two size
    /// `s`. Returns the offset of the resulting block, or `None` if the
    /// request cannot be served (the block at `b` is then untouched).
    fn extend_block(&mut self, b: u32, s: u32) -> Result<Option<u32>, BlockError> {
        if b % MIN_BLOCK != 0 {
            return Err(BlockError::NotFound);
        }

        let unit = (b / MIN_BLOCK) as usize;
        let current = self.size_map.get(unit);
        if current == 0 || current > self.amax {
            return Err(BlockError::NotFound);
        }

        let current_size = 1u32 << current;
        if current_size == s {
            return Ok(Some(b));
        }

        let target = s.ilog2() as u8;
        if current_size < s {
            if self.grow_in_place(b, current, target) {
                return Ok(Some(b));
            }

            let Some(nb) = self.take_block(target) else {
                return Ok(None);
            };
            unsafe {
                self.base.copy_nonoverlapping(b, nb, current_size as usize);
            }
            // The old block is known to be live, so a failure to free it
            // means the bookkeeping is corrupt.
            self.free_block(b).map_err(|_| BlockError::Internal)?;
            Ok(Some(nb))
        } else {
            self.shrink(b, current, target);
            Ok(Some(b))
        }
    }

    /// Grows the block at `b` from class `current` to class `target` by
    /// absorbing its buddies.
    ///
    /// Every step requires the buddy to lie to the right of the block and
    /// to be free; a dry run checks all steps before any state changes.
    fn grow_in_place(&mut self, b: u32, current: u8, target: u8) -> bool {
        let mut i = current;
        while i < target {
            let buddy = find_buddy(b, i);
            if buddy < b || !self.is_avail(i, buddy) {
                break;
            }
            i += 1;
        }
        if i != target {
            return false;
        }

        for j in current..target {
            let buddy = find_buddy(b, j);
            self.remove_avail(j, buddy);
        }

        let unit = (b / MIN_BLOCK) as usize;
        self.size_map.erase(unit);
        self.size_map.put(unit, target);
        true
    }

    /// Shrinks the block at `b` from class `current` to class `target` in
    /// place, releasing the tail.
    fn shrink(&mut self, b: u32, current: u8, target: u8) {
        let unit = (b / MIN_BLOCK) as usize;
        self.size_map.erase(unit);
        self.size_map.put(unit, target);

        let kept = 1u32 << target;
        let mut at = b + kept;
        self.insert_avail(target, at);
        at += kept;

        // Release the rest in aligned power-of-two steps. This terminates
        // with no remainder because all class sizes are multiples of the
        // minimal block.
        let mut rest = (1u32 << current) - (kept << 1);
        while rest > 0 {
            let mut step = rest.next_power_of_two();
            if step != rest {
                step >>= 2;
            }
            self.insert_avail(step.ilog2() as u8, at);
            rest -= step;
            at += step;
        }
    }

    /// Determines the size and state of the block starting at `b` for the
    /// introspection walk: live blocks from the size area, free blocks by
    /// searching the avail lists. `None` means the block is lost.
    fn classify(&self, b: u32) -> Option<(u32, bool)> {
        let k = self.size_map.get((b / MIN_BLOCK) as usize);
        if k != 0 {
            return Some((1u32 << k, true));
        }

        (0..=self.amax)
            .find(|&k| self.is_avail(k, b))
            .map(|k| (1u32 << k, false))
    }

    /// Walks the main-heap block partition, accumulating byte counters.
    /// The second component is the offset of a lost block that stopped
    /// the walk, if any.
    fn scan(&self) -> (HeapStats, Option<u32>) {
        let mut stats = HeapStats {
            total: self.main_size,
            used: 0,
            free: 0,
        };

        let mut b = 0;
        while b < self.main_size {
            let Some((size, used)) = self.classify(b) else {
                return (stats, Some(b));
            };

            if used {
                stats.used += size;
            } else {
                stats.free += size;
            }
            b += size;
        }

        (stats, None)
    }

    // -- avail lists -------------------------------------------------------
    //
    // One doubly-linked list per size class. The heads live in the avail
    // table; the links live in the first 8 bytes of the free blocks
    // themselves. All offsets handed to these come from the arena's own
    // bookkeeping and are in bounds for the region.

    #[inline]
    fn head_slot(&self, k: u8) -> u32 {
        self.avail_ofs + 4 * u32::from(k)
    }

    #[inline]
    fn avail_head(&self, k: u8) -> Option<u32> {
        decode(unsafe { self.base.read_u32(self.head_slot(k)) })
    }

    #[inline]
    fn set_avail_head(&mut self, k: u8, link: Option<u32>) {
        unsafe { self.base.write_u32(self.head_slot(k), encode(link)) };
    }

    #[inline]
    fn next_of(&self, b: u32) -> Option<u32> {
        decode(unsafe { self.base.read_u32(b) })
    }

    #[inline]
    fn prev_of(&self, b: u32) -> Option<u32> {
        decode(unsafe { self.base.read_u32(b + 4) })
    }

    #[inline]
    fn set_next(&mut self, b: u32, link: Option<u32>) {
        unsafe { self.base.write_u32(b, encode(link)) };
    }

    #[inline]
    fn set_prev(&mut self, b: u32, link: Option<u32>) {
        unsafe { self.base.write_u32(b + 4, encode(link)) };
    }

    /// Pushes the block at `b` onto the head of list `k`.
    fn insert_avail(&mut self, k: u8, b: u32) {
        debug_assert!(b < self.main_size);

        let head = self.avail_head(k);
        self.set_next(b, head);
        self.set_prev(b, None);
        if let Some(h) = head {
            self.set_prev(h, Some(b));
        }
        self.set_avail_head(k, Some(b));
    }

    /// Unlinks the block at `b` from list `k`.
    ///
    /// `b` must be a member of the list (callers either pop the head or
    /// have checked membership via `is_avail`).
    fn remove_avail(&mut self, k: u8, b: u32) {
        let next = self.next_of(b);
        let prev = self.prev_of(b);

        match prev {
            Some(p) => self.set_next(p, next),
            None => self.set_avail_head(k, next),
        }
        if let Some(n) = next {
            self.set_prev(n, prev);
        }

        // Reset the link bytes so a stale pattern can never alias a live
        // list node.
        unsafe { self.base.fill(b, 8, 0xff) };
    }

    /// Returns whether the block at `b` is a member of list `k`.
    fn is_avail(&self, k: u8, b: u32) -> bool {
        let mut cur = self.avail_head(k);
        while let Some(c) = cur {
            if c == b {
                return true;
            }
            cur = self.next_of(c);
        }
        false
    }
}

impl<A: BackingAllocator> Drop for Buddy<A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), self.layout)
        };
    }
}

impl<A: BackingAllocator> fmt::Debug for Buddy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("base", &self.base)
            .field("heap_size", &self.heap_size)
            .field("main_size", &self.main_size)
            .field("amax", &self.amax)
            .field("emergency", &self.emergency.is_some())
            .finish()
    }
}

/// A rendered view of a [`Buddy`] arena's block structure.
///
/// Produced by [`Buddy::heap_map`]; the [`Display`](core::fmt::Display)
/// impl writes one colored token per block followed by the totals, and
/// the emergency heap's map when present.
pub struct HeapMap<'a, A: BackingAllocator> {
    heap: &'a Buddy<A>,
}

impl<A: BackingAllocator> fmt::Display for HeapMap<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap;
        let mut stats = HeapStats {
            total: heap.main_size,
            used: 0,
            free: 0,
        };

        let mut b = 0;
        while b < heap.main_size {
            match heap.classify(b) {
                Some((size, used)) => {
                    report::write_block(f, size, used)?;
                    if used {
                        stats.used += size;
                    } else {
                        stats.free += size;
                    }
                    b += size;
                }
                None => {
                    writeln!(f, "LOST BLOCK: {}", b)?;
                    break;
                }
            }
        }

        report::write_totals(f, &stats)?;

        if let Some(ff) = heap.emergency.as_ref() {
            writeln!(f, "### EMERGENCY ##############")?;
            write!(f, "{}", ff.heap_map())?;
        }

        Ok(())
    }
}

impl<A: BackingAllocator> fmt::Debug for HeapMap<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapMap").finish_non_exhaustive()
    }
}

/// Like a `Buddy`, but without a `Drop` impl or an associated backing
/// allocator.
///
/// This assists in tacking on the allocator type parameter, because this
/// struct can be moved out of while `Buddy` itself cannot.
struct RawBuddy {
    base: BasePtr,
    heap_size: u32,
    main_size: u32,
    amax: u8,
    avail_ofs: u32,
    size_map: SizeMap,
    emergency: Option<FirstFit<Raw>>,
    layout: Layout,
}

impl RawBuddy {
    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Buddy<A> {
        Buddy {
            base: self.base,
            heap_size: self.heap_size,
            main_size: self.main_size,
            amax: self.amax,
            avail_ofs: self.avail_ofs,
            size_map: self.size_map,
            emergency: self.emergency,
            layout: self.layout,
            backing_allocator,
        }
    }

    /// Initializes a buddy heap over `region`.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `layout.size()`
    /// bytes.
    unsafe fn try_new(
        region: NonNull<u8>,
        layout: Layout,
        emergency: bool,
    ) -> Result<RawBuddy, AllocInitError> {
        let size = layout.size();
        if size == 0 || size > u32::MAX as usize {
            return Err(AllocInitError::InvalidConfig);
        }

        let main_size = (size / 2) as u32;
        if !main_size.is_power_of_two() {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = BasePtr::new(region, size)?;

        let amax = main_size.ilog2() as u8;
        let avail_size = (u32::from(amax) + 1) * 4;
        let num_units = (main_size / MIN_BLOCK) as usize;
        let map_size = SizeMap::map_size(num_units) as u32;

        let emergency_size = main_size
            .checked_sub(avail_size + map_size)
            .ok_or(AllocInitError::InvalidConfig)?;
        let avail_ofs = main_size + emergency_size;
        let map_ofs = avail_ofs + avail_size;

        log::debug!(
            "buddy heap: main {} B, emergency {} B at +{:#x}, avail table at +{:#x}, \
             size area {} B at +{:#x}, amax {}, bookkeeping {}%",
            main_size,
            emergency_size,
            main_size,
            avail_ofs,
            map_size,
            map_ofs,
            amax,
            u64::from(avail_size + map_size) * 100 / u64::from(main_size),
        );

        unsafe {
            // Fill the main heap and the avail table with the no-block
            // pattern: every list starts out empty.
            base.fill(0, main_size as usize, 0xff);
            base.fill(avail_ofs, avail_size as usize, 0xff);
        }

        let size_map =
            unsafe { SizeMap::new(num_units, base.ptr().as_ptr().add(map_ofs as usize)) };

        // Seed the avail lists: the whole main heap is one free block of
        // class `amax` at offset 0.
        unsafe {
            base.write_u32(0, NO_BLOCK);
            base.write_u32(4, NO_BLOCK);
            base.write_u32(avail_ofs + 4 * u32::from(amax), 0);
        }

        let emergency = if emergency {
            let sub = base.with_offset(main_size).unwrap();
            Some(unsafe { FirstFit::new_raw(sub, emergency_size as usize)? })
        } else {
            None
        };

        Ok(RawBuddy {
            base,
            heap_size: size as u32,
            main_size,
            amax,
            avail_ofs,
            size_map,
            emergency,
            layout,
        })
    }
}
