//! Common types and constants shared across the simulator.
//!
//! This module provides:
//! 1. **Addresses:** Runtime-extent bit slices and typed block/page numbers.
//! 2. **Access types:** The request taxonomy used by every queue and cache.
//! 3. **Bit utilities:** Mask and log2 helpers used by address decomposition.
//! 4. **Errors:** The simulator-level error type.
//! 5. **Tables:** A generic set-associative LRU table (DIB, PSCL).

pub mod addr;
pub mod error;
pub mod table;

pub use self::addr::{AddressSlice, BlockNumber, PageNumber, PageOffset};
pub use self::error::SimError;
pub use self::table::LruTable;

/// Cache block (line) size in bytes.
pub const BLOCK_SIZE: u64 = 64;

/// log2 of the cache block size.
pub const LOG2_BLOCK_SIZE: u32 = 6;

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of the page size.
pub const LOG2_PAGE_SIZE: u32 = 12;

/// Size of one page-table entry in bytes.
pub const PTE_BYTES: u64 = 8;

/// Returns a mask with the low `bits` bits set.
#[inline]
pub const fn bitmask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Returns floor(log2(x)). `x` must be nonzero.
#[inline]
pub const fn lg2(x: u64) -> u32 {
    63 - x.leading_zeros()
}

/// The kind of memory access carried by a request.
///
/// The order matches the per-type statistics arrays: an access type's
/// discriminant indexes into `hits`/`misses` tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(usize)]
pub enum AccessType {
    /// Demand read.
    Load = 0,
    /// Read-for-ownership (a store miss forwarded downward).
    Rfo = 1,
    /// Hardware prefetch.
    Prefetch = 2,
    /// Writeback from an upper level.
    Write = 3,
    /// Page-table walk read.
    Translation = 4,
}

/// Number of distinct access types (size of per-type statistics arrays).
pub const NUM_ACCESS_TYPES: usize = 5;

impl AccessType {
    /// All access types, in statistics order.
    pub const ALL: [AccessType; NUM_ACCESS_TYPES] = [
        AccessType::Load,
        AccessType::Rfo,
        AccessType::Prefetch,
        AccessType::Write,
        AccessType::Translation,
    ];

    /// Short name used in statistics output and deadlock dumps.
    pub fn name(self) -> &'static str {
        match self {
            AccessType::Load => "LOAD",
            AccessType::Rfo => "RFO",
            AccessType::Prefetch => "PREFETCH",
            AccessType::Write => "WRITE",
            AccessType::Translation => "TRANSLATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmask() {
        assert_eq!(bitmask(0), 0);
        assert_eq!(bitmask(6), 0x3f);
        assert_eq!(bitmask(64), u64::MAX);
    }

    #[test]
    fn test_lg2() {
        assert_eq!(lg2(1), 0);
        assert_eq!(lg2(2), 1);
        assert_eq!(lg2(64), 6);
        assert_eq!(lg2(4096), 12);
    }
}
