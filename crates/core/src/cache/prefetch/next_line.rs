//! Next-line prefetcher.

use crate::cache::Cache;
use crate::common::{AccessType, BLOCK_SIZE};

use super::Prefetcher;

/// Prefetches the sequentially next block on every activating access.
pub struct NextLine;

impl Prefetcher for NextLine {
    fn prefetcher_cache_operate(
        &mut self,
        cache: &mut Cache,
        addr: u64,
        _ip: u64,
        _hit: bool,
        _useful_prefetch: bool,
        _kind: AccessType,
        metadata_in: u32,
    ) -> u32 {
        cache.prefetch_line(addr.wrapping_add(BLOCK_SIZE), true, metadata_in);
        metadata_in
    }
}
