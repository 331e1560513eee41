//! Instruction-pointer stride prefetcher.
//!
//! Tracks the last block touched by each instruction pointer. When the same
//! ip produces the same block stride twice in a row, the next `DEGREE`
//! blocks along that stride are prefetched.

use crate::cache::Cache;
use crate::common::{AccessType, LOG2_BLOCK_SIZE};

use super::Prefetcher;

/// Tracked instruction pointers.
const TABLE_SIZE: usize = 256;

/// Blocks prefetched ahead once a stride is confirmed.
const DEGREE: usize = 3;

#[derive(Clone, Copy, Default)]
struct TrackerEntry {
    ip: u64,
    last_cl_addr: u64,
    last_stride: i64,
}

/// Reference prediction table keyed by ip.
pub struct IpStride {
    table: Vec<TrackerEntry>,
}

impl Default for IpStride {
    fn default() -> Self {
        Self {
            table: vec![TrackerEntry::default(); TABLE_SIZE],
        }
    }
}

impl Prefetcher for IpStride {
    fn prefetcher_cache_operate(
        &mut self,
        cache: &mut Cache,
        addr: u64,
        ip: u64,
        _hit: bool,
        _useful_prefetch: bool,
        _kind: AccessType,
        metadata_in: u32,
    ) -> u32 {
        let cl_addr = addr >> LOG2_BLOCK_SIZE;
        let slot = (ip as usize) % TABLE_SIZE;
        let entry = &mut self.table[slot];

        if entry.ip != ip {
            *entry = TrackerEntry {
                ip,
                last_cl_addr: cl_addr,
                last_stride: 0,
            };
            return metadata_in;
        }

        let stride = cl_addr as i64 - entry.last_cl_addr as i64;
        if stride != 0 && stride == entry.last_stride {
            for k in 1..=DEGREE {
                let target = (cl_addr as i64 + stride * k as i64) as u64;
                cache.prefetch_line(target << LOG2_BLOCK_SIZE, true, metadata_in);
            }
        }

        entry.last_cl_addr = cl_addr;
        entry.last_stride = stride;
        metadata_in
    }
}
