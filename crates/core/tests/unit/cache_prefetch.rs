//! Prefetch scenario tests.
//!
//! Covers the three prefetch behaviors the cache must get right: a
//! prefetched block serves a later demand access at hit latency and counts
//! as useful exactly once; a duplicate prefetch is never useful; and the
//! ip-stride prefetcher extends a detected stride below the cache.

use crate::common::{CacheBench, small_cache_config};
use tracesim_core::channel::Request;
use tracesim_core::common::{BLOCK_SIZE, LOG2_BLOCK_SIZE};
use tracesim_core::config::{CacheConfig, PrefetcherKind};

// ══════════════════════════════════════════════════════════
// 1. Single prefetch, then a demand hit
// ══════════════════════════════════════════════════════════

#[test]
fn prefetch_fills_and_demand_hit_is_useful() {
    let hit_latency = 2;
    let mut bench = CacheBench::new(small_cache_config("pf-hit-uut"));

    assert_eq!(bench.cache.stats.pf_issued, 0);
    assert_eq!(bench.cache.stats.pf_useful, 0);
    assert_eq!(bench.cache.stats.pf_fill, 0);

    assert!(bench.cache.prefetch_line(0xdead_beef, true, 0));
    bench.run(100);

    assert_eq!(bench.cache.stats.pf_issued, 1);
    assert_eq!(bench.cache.stats.pf_fill, 1);

    // A demand read to the prefetched block hits at hit latency.
    bench.upper.issue(Request {
        address: 0xdead_beef,
        v_address: 0xdead_beef,
        instr_id: 1,
        ..Request::default()
    });
    bench.run(2 * hit_latency as usize);

    let packet = bench.upper.packets.last().unwrap();
    assert_ne!(packet.return_time, 0, "the read must have returned");
    assert_eq!(packet.return_time, packet.issue_time + hit_latency + 1);
    assert_eq!(bench.cache.stats.pf_useful, 1);
}

// ══════════════════════════════════════════════════════════
// 2. Duplicate prefetch
// ══════════════════════════════════════════════════════════

#[test]
fn duplicate_prefetch_is_never_useful() {
    let hit_latency = 2u64;
    let mut bench = CacheBench::new(small_cache_config("pf-dup-uut"));

    assert!(bench.cache.prefetch_line(0xdead_beef, true, 0));
    bench.run(100);
    assert_eq!(bench.cache.stats.pf_fill, 1);

    // A second prefetch of the same block hits its own fill.
    assert!(bench.cache.prefetch_line(0xdead_beef, true, 0));
    bench.run(2 * hit_latency as usize);

    assert_eq!(bench.cache.stats.pf_issued, 2);
    assert_eq!(bench.cache.stats.pf_useful, 0);
}

// ══════════════════════════════════════════════════════════
// 3. IP-stride across the lower level
// ══════════════════════════════════════════════════════════

fn stride_config() -> CacheConfig {
    CacheConfig {
        name: "stride-uut".into(),
        sets: 64,
        ways: 12,
        mshr_size: 16,
        pq_size: 8,
        hit_latency: 4,
        fill_latency: 1,
        max_tag: 2,
        max_fill: 2,
        prefetcher: PrefetcherKind::IpStride,
        ..CacheConfig::default()
    }
}

#[test]
fn ip_stride_extends_the_pattern_below() {
    for stride in [-4i64, -3, -2, -1, 1, 2, 3, 4] {
        let mut bench = CacheBench::new(stride_config());
        let base = 0xffff_003fi64;
        let ip = 0xcafe_cafe;

        for i in 0..3 {
            let addr = (base + stride * i * BLOCK_SIZE as i64) as u64;
            bench.upper.issue(Request {
                address: addr,
                v_address: addr,
                ip,
                instr_id: 1 + i as u64,
                ..Request::default()
            });
            bench.run(20);
        }
        bench.run(100);

        let blocks: Vec<i64> = bench
            .lower
            .addresses
            .iter()
            .map(|&a| (a >> LOG2_BLOCK_SIZE) as i64)
            .collect();
        assert!(
            blocks.len() >= 6,
            "stride {}: expected at least 6 lower-level requests, got {:?}",
            stride,
            blocks
        );
        for pair in blocks.windows(2) {
            assert_eq!(pair[1] - pair[0], stride, "stride {}: sequence {:?}", stride, blocks);
        }
    }
}
