//! Hardware prefetcher implementations.
//!
//! A cache composes zero or one prefetcher. Prefetchers observe tag checks
//! and fills, and inject new requests through [`Cache::prefetch_line`]. All
//! hooks are defaulted so an implementation only writes the ones it needs.

pub mod ip_stride;
pub mod next_line;

pub use self::ip_stride::IpStride;
pub use self::next_line::NextLine;

use crate::cache::Cache;
use crate::common::AccessType;
use crate::config::PrefetcherKind;
use crate::core::instruction::BranchType;

/// Operations a prefetcher may provide.
pub trait Prefetcher: Send {
    /// One-time setup after the cache is constructed.
    fn prefetcher_initialize(&mut self) {}

    /// Observes a tag check. Returns the metadata to propagate.
    #[allow(clippy::too_many_arguments)]
    fn prefetcher_cache_operate(
        &mut self,
        _cache: &mut Cache,
        _addr: u64,
        _ip: u64,
        _hit: bool,
        _useful_prefetch: bool,
        _kind: AccessType,
        metadata_in: u32,
    ) -> u32 {
        metadata_in
    }

    /// Observes a fill. Returns the metadata to store with the block.
    #[allow(clippy::too_many_arguments)]
    fn prefetcher_cache_fill(
        &mut self,
        _cache: &mut Cache,
        _addr: u64,
        _set: usize,
        _way: usize,
        _prefetch: bool,
        _evicted_addr: u64,
        metadata_in: u32,
    ) -> u32 {
        metadata_in
    }

    /// Runs once per cache tick.
    fn prefetcher_cycle_operate(&mut self, _cache: &mut Cache) {}

    /// Observes a retired branch (instruction prefetchers).
    fn prefetcher_branch_operate(&mut self, _cache: &mut Cache, _ip: u64, _branch_type: BranchType, _target: u64) {}

    /// Final statistics hook.
    fn prefetcher_final_stats(&mut self) {}
}

/// The default no-op prefetcher.
pub struct NoPrefetcher;

impl Prefetcher for NoPrefetcher {}

/// Builds the configured prefetcher.
pub fn build(kind: PrefetcherKind) -> Box<dyn Prefetcher> {
    match kind {
        PrefetcherKind::None => Box::new(NoPrefetcher),
        PrefetcherKind::NextLine => Box::new(NextLine),
        PrefetcherKind::IpStride => Box::new(IpStride::default()),
    }
}
