//! Shared mocks for component scenario tests.
//!
//! Two channel drivers stand in for the rest of the machine:
//! - [`MockLowerLevel`] plays the level below the unit under test: it
//!   records every request in arrival order and, unless told otherwise,
//!   answers each one on its next tick.
//! - [`MockUpper`] plays the requester above: it issues packets into the
//!   unit's upstream channel and records when each response comes back.
//!
//! Both keep their own cycle counters, so per-tick ordering matches the
//! real machine: lower level first, then the upper driver, then the unit.

use std::collections::VecDeque;

use tracesim_core::cache::Cache;
use tracesim_core::channel::{ChannelId, Channels, Request, Response};
use tracesim_core::common::LOG2_BLOCK_SIZE;
use tracesim_core::config::CacheConfig;

/// The component below the unit under test.
pub struct MockLowerLevel {
    pub channel: ChannelId,
    /// Addresses of every request, in arrival order across all queues.
    pub addresses: Vec<u64>,
    /// When false, requests are recorded but never answered.
    pub respond: bool,
    cycle: u64,
}

impl MockLowerLevel {
    pub fn new(channels: &mut Channels) -> Self {
        let channel = channels.create(32, 32, 32, LOG2_BLOCK_SIZE, false);
        Self {
            channel,
            addresses: Vec::new(),
            respond: true,
            cycle: 0,
        }
    }

    pub fn operate(&mut self, channels: &mut Channels) {
        self.cycle += 1;
        let chan = &mut channels[self.channel];

        let mut responses = Vec::new();
        while let Some(req) = chan.rq.pop_front() {
            self.addresses.push(req.address);
            if self.respond && req.response_requested {
                responses.push(Response::for_request(&req, req.address));
            }
        }
        while let Some(req) = chan.pq.pop_front() {
            self.addresses.push(req.address);
            if self.respond && req.response_requested {
                responses.push(Response::for_request(&req, req.address));
            }
        }
        while let Some(req) = chan.wq.pop_front() {
            self.addresses.push(req.address);
        }
        chan.returned.extend(responses);
    }
}

/// One issued packet and its observed timing.
#[derive(Clone, Copy, Debug)]
pub struct PacketRecord {
    pub address: u64,
    pub issue_time: u64,
    pub return_time: u64,
}

/// The requester above the unit under test.
pub struct MockUpper {
    pub channel: ChannelId,
    pub packets: Vec<PacketRecord>,
    to_issue: VecDeque<Request>,
    cycle: u64,
}

impl MockUpper {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            packets: Vec::new(),
            to_issue: VecDeque::new(),
            cycle: 0,
        }
    }

    /// Queues a read to be issued on this driver's next tick.
    pub fn issue(&mut self, req: Request) {
        self.to_issue.push_back(req);
    }

    pub fn operate(&mut self, channels: &mut Channels) {
        self.cycle += 1;
        let chan = &mut channels[self.channel];

        // Match responses to the oldest outstanding packet on the block.
        while let Some(response) = chan.returned.pop_front() {
            let block = response.address >> LOG2_BLOCK_SIZE;
            if let Some(record) = self
                .packets
                .iter_mut()
                .find(|p| p.return_time == 0 && p.address >> LOG2_BLOCK_SIZE == block)
            {
                record.return_time = self.cycle;
            }
        }

        while let Some(front) = self.to_issue.front() {
            let address = front.address;
            if chan.add_rq(front.clone()) {
                self.to_issue.pop_front();
                self.packets.push(PacketRecord {
                    address,
                    issue_time: self.cycle,
                    return_time: 0,
                });
            } else {
                break;
            }
        }
    }
}

/// A cache under test between the two mocks.
pub struct CacheBench {
    pub channels: Channels,
    pub lower: MockLowerLevel,
    pub upper: MockUpper,
    pub cache: Cache,
}

impl CacheBench {
    /// Wires a cache from `config` with one upstream channel and a mock
    /// lower level.
    pub fn new(config: CacheConfig) -> Self {
        let mut channels = Channels::new();
        let lower = MockLowerLevel::new(&mut channels);
        let upper_channel = channels.create(
            config.rq_size,
            config.upstream_pq_size,
            config.wq_size,
            config.offset_bits,
            config.match_offset_bits,
        );
        let mut cache = Cache::new(&config, vec![upper_channel], lower.channel, None);
        cache.initialize();
        let upper = MockUpper::new(upper_channel);
        Self {
            channels,
            lower,
            upper,
            cache,
        }
    }

    /// One machine tick: lower level, upper driver, then the cache.
    pub fn cycle(&mut self) {
        self.lower.operate(&mut self.channels);
        self.upper.operate(&mut self.channels);
        self.cache.operate(&mut self.channels);
    }

    /// Runs `n` ticks.
    pub fn run(&mut self, n: usize) {
        for _ in 0..n {
            self.cycle();
        }
    }
}

/// A small cache configuration shared by the prefetch scenarios.
pub fn small_cache_config(name: &str) -> CacheConfig {
    CacheConfig {
        name: name.into(),
        sets: 1,
        ways: 8,
        mshr_size: 8,
        pq_size: 16,
        hit_latency: 2,
        fill_latency: 2,
        max_tag: 2,
        max_fill: 2,
        ..CacheConfig::default()
    }
}

