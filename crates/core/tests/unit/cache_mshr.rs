//! MSHR merge and occupancy tests.

use crate::common::{CacheBench, MockLowerLevel, MockUpper, small_cache_config};
use tracesim_core::cache::Cache;
use tracesim_core::channel::{Channels, Request, Response};
use tracesim_core::config::CacheConfig;

// ══════════════════════════════════════════════════════════
// 1. Two misses to one block share one MSHR
// ══════════════════════════════════════════════════════════

/// Two requesters on separate channels miss the same block: the MSHR grows
/// by one, a single request descends, and both requesters get a response
/// when the lower level answers.
#[test]
fn same_block_misses_merge_into_one_mshr() {
    let config = small_cache_config("mshr-merge-uut");
    let mut channels = Channels::new();
    let mut lower = MockLowerLevel::new(&mut channels);
    lower.respond = false;

    let mk = |channels: &mut Channels, c: &CacheConfig| {
        channels.create(c.rq_size, c.upstream_pq_size, c.wq_size, c.offset_bits, c.match_offset_bits)
    };
    let chan_a = mk(&mut channels, &config);
    let chan_b = mk(&mut channels, &config);
    let mut cache = Cache::new(&config, vec![chan_a, chan_b], lower.channel, None);
    cache.initialize();
    let mut upper_a = MockUpper::new(chan_a);
    let mut upper_b = MockUpper::new(chan_b);

    let mut run = |channels: &mut Channels,
                   lower: &mut MockLowerLevel,
                   a: &mut MockUpper,
                   b: &mut MockUpper,
                   cache: &mut Cache,
                   n: usize| {
        for _ in 0..n {
            lower.operate(channels);
            a.operate(channels);
            b.operate(channels);
            cache.operate(channels);
        }
    };

    // Both requesters miss the same block in the same tick.
    upper_a.issue(Request {
        address: 0x4000,
        v_address: 0x4000,
        instr_id: 1,
        instr_depend_on_me: vec![1],
        ..Request::default()
    });
    upper_b.issue(Request {
        address: 0x4008,
        v_address: 0x4008,
        instr_id: 2,
        instr_depend_on_me: vec![2],
        ..Request::default()
    });
    run(&mut channels, &mut lower, &mut upper_a, &mut upper_b, &mut cache, 10);

    assert_eq!(cache.mshr_occupancy(), 1, "the misses share one MSHR");
    assert_eq!(lower.addresses.len(), 1, "only one request descends");

    // The lower level answers once; both requesters hear back.
    let response = Response {
        address: 0x4000,
        v_address: 0x4000,
        data: 0,
        pf_metadata: 0,
        instr_depend_on_me: Vec::new(),
    };
    channels[lower.channel].returned.push_back(response);
    run(&mut channels, &mut lower, &mut upper_a, &mut upper_b, &mut cache, 10);

    assert_eq!(cache.mshr_occupancy(), 0);
    assert_ne!(upper_a.packets[0].return_time, 0, "first requester answered");
    assert_ne!(upper_b.packets[0].return_time, 0, "second requester answered");
}

// ══════════════════════════════════════════════════════════
// 2. Occupancy never exceeds the configured size
// ══════════════════════════════════════════════════════════

#[test]
fn mshr_occupancy_is_bounded() {
    let config = CacheConfig {
        mshr_size: 4,
        ..small_cache_config("mshr-bound-uut")
    };
    let mut bench = CacheBench::new(config);
    bench.lower.respond = false;

    for i in 0..32u64 {
        bench.upper.issue(Request {
            address: 0x10000 + i * 0x40,
            v_address: 0x10000 + i * 0x40,
            instr_id: i,
            ..Request::default()
        });
        bench.cycle();
        assert!(bench.cache.mshr_occupancy() <= 4);
    }
    bench.run(50);
    assert!(bench.cache.mshr_occupancy() <= 4);
    assert_eq!(bench.cache.mshr_occupancy(), 4, "back-pressure holds at capacity");
    assert_eq!(bench.lower.addresses.len(), 4, "only allocated misses descend");
}
