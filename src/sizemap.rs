//! The buddy size area: a bit-packed table recording the size class of
//! every live block.
//!
//! The main heap is viewed as a sequence of 8-byte minimal units. For each
//! unit the table stores 6 bits: the size-class exponent of the block that
//! starts at that unit, or 0 if no live block starts there. Six bits cover
//! exponents up to 63, comfortably above the 32 supported by 32-bit
//! pseudo-pointers.

pub struct SizeMap {
    num_units: usize,
    map: *mut u8,
}

impl SizeMap {
    /// Returns the number of bytes required to back a `SizeMap` with
    /// `num_units` entries.
    ///
    /// One extra entry is included so the codec may always touch the byte
    /// after the one an entry starts in.
    pub fn map_size(num_units: usize) -> usize {
        ((num_units + 1) * 6 + 7) / 8
    }

    /// Constructs a new size map of `num_units` entries, backed by `map`.
    ///
    /// All entries are initialized to zero.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are
    /// violated:
    /// - `map` must be valid for reads and writes for
    ///   `SizeMap::map_size(num_units)` bytes.
    /// - The backing memory must not be mutated by anything else while the
    ///   `SizeMap` exists.
    pub unsafe fn new(num_units: usize, map: *mut u8) -> SizeMap {
        assert!(num_units > 0);
        assert!(!map.is_null());

        unsafe { map.write_bytes(0, Self::map_size(num_units)) };

        SizeMap { num_units, map }
    }

    /// Returns a tuple of the index of the byte the entry starts in and the
    /// bit offset of the entry within that byte.
    #[inline]
    const fn index_and_shift(unit: usize) -> (usize, u32) {
        let bit = unit * 6;
        (bit / 8, (bit % 8) as u32)
    }

    /// Gets the value of the indexed entry.
    #[inline]
    pub fn get(&self, unit: usize) -> u8 {
        assert!(unit < self.num_units);

        let (y, b) = Self::index_and_shift(unit);

        // The entry may straddle a byte boundary; reassemble it from the
        // two bytes it can touch. Widening to u16 keeps the shifts by up
        // to 8 defined.
        unsafe {
            let hi = ((u16::from(self.map.add(y).read()) << b) & 0xff) as u8;
            let lo = (u16::from(self.map.add(y + 1).read()) >> (8 - b)) as u8;
            (hi | lo) >> 2
        }
    }

    /// Sets the indexed entry to `class`.
    ///
    /// The entry must be zero (cleared) beforehand; the bits are or-ed in.
    #[inline]
    pub fn put(&mut self, unit: usize, class: u8) {
        assert!(unit < self.num_units);
        debug_assert!(class < 64);

        let (y, b) = Self::index_and_shift(unit);
        let wide = u16::from(class) << 2;

        unsafe {
            let head = self.map.add(y);
            head.write(head.read() | (wide >> b) as u8);
            let tail = self.map.add(y + 1);
            tail.write(tail.read() | ((wide << (8 - b)) & 0xff) as u8);
        }
    }

    /// Clears the indexed entry without touching its neighbours.
    #[inline]
    pub fn erase(&mut self, unit: usize) {
        assert!(unit < self.num_units);

        let (y, b) = Self::index_and_shift(unit);

        unsafe {
            let head = self.map.add(y);
            if b == 0 {
                head.write(head.read() & (0xff >> 6));
            } else {
                head.write(head.read() & (0xff << (8 - b)));
                let tail = self.map.add(y + 1);
                tail.write(tail.read() & (0xff >> (b - 2)));
            }
        }
    }
}
