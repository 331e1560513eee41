//! Address slices and typed address components.
//!
//! A 64-bit address is manipulated as half-open bit ranges `[lower, upper)`.
//! This module provides:
//! 1. **`AddressSlice`:** A slice with runtime extents, validated by assertions.
//! 2. **Splice/offset:** Bitwise recombination and signed distance of slices.
//! 3. **Newtypes:** `BlockNumber`, `PageNumber`, and `PageOffset` wrappers that
//!    keep block- and page-granular values from being mixed by accident.

use super::{LOG2_BLOCK_SIZE, LOG2_PAGE_SIZE, bitmask};

/// A slice of a 64-bit address covering the bit positions `[lower, upper)`.
///
/// The stored value is always masked to the slice width; bits outside the
/// extent are never set. Extent violations are programmer errors and abort
/// the simulator.
#[derive(Clone, Copy, Debug)]
pub struct AddressSlice {
    value: u64,
    upper: u32,
    lower: u32,
}

impl AddressSlice {
    /// Creates a slice over `[lower, upper)` holding `value`.
    ///
    /// `value` is expressed relative to the slice (bit 0 of `value` is bit
    /// `lower` of the address) and is truncated to the slice width.
    pub fn new(upper: u32, lower: u32, value: u64) -> Self {
        assert!(lower <= upper, "slice bounds are reversed");
        assert!(upper <= 64, "slice upper bound exceeds the address width");
        Self {
            value: value & bitmask(upper - lower),
            upper,
            lower,
        }
    }

    /// Creates a full-width slice from a raw address.
    pub fn from_raw(value: u64) -> Self {
        Self::new(64, 0, value)
    }

    /// The slice's value, relative to its own lower bound.
    #[inline]
    pub fn value(self) -> u64 {
        self.value
    }

    /// The value shifted back into absolute address position.
    #[inline]
    pub fn absolute(self) -> u64 {
        self.value << self.lower
    }

    /// Upper extent (exclusive).
    #[inline]
    pub fn upper_extent(self) -> u32 {
        self.upper
    }

    /// Lower extent (inclusive).
    #[inline]
    pub fn lower_extent(self) -> u32 {
        self.lower
    }

    /// Takes a sub-slice `[low, up)` relative to this slice's lower bound.
    ///
    /// The result's extents are absolute: `[self.lower + low, self.lower + up)`.
    pub fn slice(self, up: u32, low: u32) -> AddressSlice {
        let width = self.upper - self.lower;
        assert!(low <= width, "sub-slice lower bound exceeds the slice width");
        assert!(up <= width, "sub-slice upper bound exceeds the slice width");
        AddressSlice::new(self.lower + up, self.lower + low, (self.value >> low) & bitmask(up - low))
    }

    /// Drops the low `new_lower` bits of this slice.
    pub fn slice_upper(self, new_lower: u32) -> AddressSlice {
        self.slice(self.upper - self.lower, new_lower)
    }

    /// Keeps only the low `new_upper` bits of this slice.
    pub fn slice_lower(self, new_upper: u32) -> AddressSlice {
        self.slice(new_upper, 0)
    }
}

/// Signed distance from `base` to `other`.
///
/// Both slices must cover the same extents; a mismatch is a programmer error.
pub fn offset(base: AddressSlice, other: AddressSlice) -> i64 {
    assert_eq!(base.upper, other.upper, "offset between differently-bounded slices");
    assert_eq!(base.lower, other.lower, "offset between differently-bounded slices");
    let abs = base.value.abs_diff(other.value);
    assert!(abs <= i64::MAX as u64, "offset overflows the signed difference type");
    if base.value > other.value { -(abs as i64) } else { abs as i64 }
}

/// Bitwise splice of two slices.
///
/// The result spans the union of both extents. Where the extents overlap, the
/// right-hand operand's bits win; the rest is filled from the left-hand
/// operand.
pub fn splice(lhs: AddressSlice, rhs: AddressSlice) -> AddressSlice {
    let upper = lhs.upper.max(rhs.upper);
    let lower = lhs.lower.min(rhs.lower);
    let keep = bitmask(rhs.upper) & !bitmask(rhs.lower);
    let merged = (lhs.absolute() & !keep) | (rhs.absolute() & keep);
    AddressSlice::new(upper, lower, (merged & bitmask(upper) & !bitmask(lower)) >> lower)
}

impl PartialEq for AddressSlice {
    /// Slices compare equal only when both extents match.
    ///
    /// Comparing differently-bounded slices is a programmer error, not a
    /// `false` result.
    fn eq(&self, other: &Self) -> bool {
        assert_eq!(self.upper, other.upper, "comparing differently-bounded slices");
        assert_eq!(self.lower, other.lower, "comparing differently-bounded slices");
        self.value == other.value
    }
}

impl core::ops::Add<i64> for AddressSlice {
    type Output = AddressSlice;

    /// Adds a signed delta, wrapping inside the slice width.
    fn add(self, delta: i64) -> AddressSlice {
        AddressSlice::new(self.upper, self.lower, self.value.wrapping_add(delta as u64))
    }
}

impl core::ops::Sub<i64> for AddressSlice {
    type Output = AddressSlice;

    fn sub(self, delta: i64) -> AddressSlice {
        self + delta.wrapping_neg()
    }
}

/// A cache-block number: the address above the block offset bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Extracts the block number from a full address.
    #[inline]
    pub fn from_addr(addr: u64) -> Self {
        Self(addr >> LOG2_BLOCK_SIZE)
    }

    /// The first byte address of this block.
    #[inline]
    pub fn to_addr(self) -> u64 {
        self.0 << LOG2_BLOCK_SIZE
    }
}

/// A virtual or physical page number: the address above the page offset bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageNumber(pub u64);

impl PageNumber {
    /// Extracts the page number from a full address.
    #[inline]
    pub fn from_addr(addr: u64) -> Self {
        Self(addr >> LOG2_PAGE_SIZE)
    }

    /// The first byte address of this page.
    #[inline]
    pub fn to_addr(self) -> u64 {
        self.0 << LOG2_PAGE_SIZE
    }

    /// Recombines this page frame with a page offset into a full address.
    #[inline]
    pub fn splice(self, off: PageOffset) -> u64 {
        self.to_addr() | off.0
    }
}

/// The byte offset within a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageOffset(pub u64);

impl PageOffset {
    /// Extracts the page offset from a full address.
    #[inline]
    pub fn from_addr(addr: u64) -> Self {
        Self(addr & bitmask(LOG2_PAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_masks_value() {
        let s = AddressSlice::new(12, 6, 0xffff);
        assert_eq!(s.value(), 0x3f);
    }

    #[test]
    fn test_slice_extracts_bits() {
        let a = AddressSlice::from_raw(0xdead_beef);
        let set = a.slice(12, 6);
        assert_eq!(set.value(), (0xdead_beef >> 6) & 0x3f);
        assert_eq!(set.lower_extent(), 6);
        assert_eq!(set.upper_extent(), 12);
    }

    #[test]
    fn test_splice_right_operand_wins() {
        let page = AddressSlice::from_raw(0x1000).slice_upper(12);
        let off = AddressSlice::from_raw(0x0abc).slice_lower(12);
        let spliced = splice(page, off);
        assert_eq!(spliced.absolute(), 0x1abc);
    }

    #[test]
    fn test_splice_overlap() {
        // Overlapping extents: rhs bits replace lhs bits where defined.
        let lhs = AddressSlice::new(16, 0, 0xffff);
        let rhs = AddressSlice::new(8, 4, 0x5);
        let spliced = splice(lhs, rhs);
        assert_eq!(spliced.absolute(), 0xff5f);
    }

    #[test]
    fn test_offset_signed() {
        let a = AddressSlice::new(20, 6, 10);
        let b = AddressSlice::new(20, 6, 14);
        assert_eq!(offset(a, b), 4);
        assert_eq!(offset(b, a), -4);
    }

    #[test]
    #[should_panic]
    fn test_offset_bound_mismatch_panics() {
        let a = AddressSlice::new(20, 6, 10);
        let b = AddressSlice::new(20, 0, 10);
        let _ = offset(a, b);
    }

    #[test]
    #[should_panic]
    fn test_eq_bound_mismatch_panics() {
        let a = AddressSlice::new(20, 6, 10);
        let b = AddressSlice::new(18, 6, 10);
        let _ = a == b;
    }

    #[test]
    fn test_arithmetic_wraps_in_width() {
        let s = AddressSlice::new(10, 6, 0xf);
        assert_eq!((s + 1).value(), 0);
        assert_eq!((s + 1 - 1).value(), 0xf);
    }

    #[test]
    fn test_construction_truncates_and_extends() {
        // From a wider slice: truncate.
        let wide = AddressSlice::from_raw(u64::MAX);
        assert_eq!(wide.slice(6, 0).value(), 0x3f);
        // A narrow value zero-extends into a wider slice.
        let narrow = AddressSlice::new(32, 0, 0xff);
        assert_eq!(narrow.value(), 0xff);
    }

    #[test]
    fn test_page_splice() {
        let frame = PageNumber(0x42);
        let off = PageOffset::from_addr(0xdead_beef);
        assert_eq!(frame.splice(off), (0x42 << 12) | 0xeef);
    }
}
