//! Zero-budget boundary behavior.
//!
//! A cache configured with a zero budget must simply never advance the
//! corresponding work, without panicking or losing requests.

use crate::common::{CacheBench, small_cache_config};
use tracesim_core::channel::Request;
use tracesim_core::config::CacheConfig;

fn read_to(addr: u64, id: u64) -> Request {
    Request {
        address: addr,
        v_address: addr,
        instr_id: id,
        ..Request::default()
    }
}

#[test]
fn zero_max_tag_checks_nothing() {
    let config = CacheConfig {
        max_tag: 0,
        ..small_cache_config("tag0-uut")
    };
    let mut bench = CacheBench::new(config);

    bench.upper.issue(read_to(0x8000, 1));
    bench.run(50);

    // No tag work: nothing descends, nothing returns, no stats move.
    assert!(bench.lower.addresses.is_empty());
    assert_eq!(bench.upper.packets[0].return_time, 0);
    let hits: u64 = bench.cache.stats.hits.iter().sum();
    let misses: u64 = bench.cache.stats.misses.iter().sum();
    assert_eq!(hits + misses, 0);
}

#[test]
fn zero_max_fill_leaves_misses_outstanding() {
    let config = CacheConfig {
        max_fill: 0,
        ..small_cache_config("fill0-uut")
    };
    let mut bench = CacheBench::new(config);

    bench.upper.issue(read_to(0x8000, 1));
    bench.run(50);

    // The miss descends and the response arrives, but the fill never runs.
    assert_eq!(bench.lower.addresses.len(), 1);
    assert_eq!(bench.cache.mshr_occupancy(), 1);
    assert_eq!(bench.upper.packets[0].return_time, 0);
}

#[test]
fn zero_mshr_size_refuses_every_miss() {
    let config = CacheConfig {
        mshr_size: 0,
        ..small_cache_config("mshr0-uut")
    };
    let mut bench = CacheBench::new(config);

    bench.upper.issue(read_to(0x8000, 1));
    bench.run(50);

    assert!(bench.lower.addresses.is_empty(), "no miss can be allocated");
    assert_eq!(bench.upper.packets[0].return_time, 0);
}
