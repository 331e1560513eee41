//! DRAM channel scenario tests.
//!
//! Timing notes: with the default 3200 MT/s configuration, tRP, tRCD, and
//! tCAS are 40 channel cycles each and the data bus transfer takes 8. The
//! first refresh burst lands on cycle 1, so fixtures warm the channel past
//! it before measuring.

use crate::common::MockUpper;
use tracesim_core::channel::{Channels, Request};
use tracesim_core::common::AccessType;
use tracesim_core::config::DramConfig;
use tracesim_core::memory::MemoryController;

struct DramBench {
    channels: Channels,
    upper: MockUpper,
    mc: MemoryController,
}

impl DramBench {
    fn new() -> Self {
        let config = DramConfig::default();
        let mut channels = Channels::new();
        let ul = channels.create(config.rq_size, 0, config.wq_size, tracesim_core::common::LOG2_BLOCK_SIZE, false);
        let mc = MemoryController::new(&config, vec![ul]);
        let upper = MockUpper::new(ul);
        Self {
            channels,
            upper,
            mc,
        }
    }

    fn cycle(&mut self) {
        self.upper.operate(&mut self.channels);
        self.mc.operate(&mut self.channels);
    }

    fn run(&mut self, n: usize) {
        for _ in 0..n {
            self.cycle();
        }
    }

    /// Issues a read and returns the cycles from issue to response.
    fn read_latency(&mut self, addr: u64, id: u64) -> u64 {
        self.upper.issue(Request {
            address: addr,
            v_address: addr,
            instr_id: id,
            ..Request::default()
        });
        let before = self.upper.packets.len();
        for _ in 0..10_000 {
            self.cycle();
            if let Some(p) = self.upper.packets.get(before) {
                if p.return_time != 0 {
                    return p.return_time - p.issue_time;
                }
            }
        }
        panic!("read to {:#x} never returned", addr);
    }
}

// Column bit just above |bank|channel|offset|: same bank and row.
const SAME_ROW_STEP: u64 = 1 << 9;
// First row bit for the default geometry.
const ROW_STEP: u64 = 1 << 16;

// ══════════════════════════════════════════════════════════
// 1. Row buffer hits and misses
// ══════════════════════════════════════════════════════════

#[test]
fn second_read_to_open_row_saves_trcd() {
    let mut bench = DramBench::new();
    bench.run(200); // past the initial refresh burst

    let (_t_rp, t_rcd, _t_cas) = bench.mc.channels[0].timing();
    let first = bench.read_latency(0x10_0000, 1);
    let second = bench.read_latency(0x10_0000 + SAME_ROW_STEP, 2);

    assert_eq!(first - second, t_rcd);
    assert_eq!(bench.mc.channels[0].stats.rq_row_buffer_miss, 1);
    assert_eq!(bench.mc.channels[0].stats.rq_row_buffer_hit, 1);
}

#[test]
fn conflicting_row_pays_precharge_and_activate() {
    let mut bench = DramBench::new();
    bench.run(200);

    let (t_rp, t_rcd, _t_cas) = bench.mc.channels[0].timing();
    let _first = bench.read_latency(0x10_0000, 1);
    let hit = bench.read_latency(0x10_0000 + SAME_ROW_STEP, 2);
    let conflict = bench.read_latency(0x10_0000 + ROW_STEP, 3);

    assert_eq!(conflict - hit, t_rp + t_rcd);
}

// ══════════════════════════════════════════════════════════
// 2. Write queue forwarding and coalescing
// ══════════════════════════════════════════════════════════

#[test]
fn read_is_served_from_the_write_queue() {
    let mut bench = DramBench::new();
    bench.run(200);

    // Queue the write, then read the same block.
    let write = Request {
        address: 0x20_0000,
        v_address: 0x20_0000,
        data: 0x1234_5678,
        kind: AccessType::Write,
        response_requested: false,
        ..Request::default()
    };
    let ul = bench.upper.channel;
    assert!(bench.channels[ul].add_wq(write));
    bench.run(2);

    bench.upper.issue(Request {
        address: 0x20_0000,
        v_address: 0x20_0000,
        instr_id: 7,
        ..Request::default()
    });
    // Forwarding happens in the collision pass, well under bank latency.
    bench.run(5);

    let packet = bench.upper.packets.last().unwrap();
    assert_ne!(packet.return_time, 0, "forwarded read returns immediately");
    assert!(packet.return_time - packet.issue_time < 5);
    assert_eq!(bench.mc.channels[0].stats.rq_row_buffer_hit, 0);
    assert_eq!(bench.mc.channels[0].stats.rq_row_buffer_miss, 0);
}

#[test]
fn duplicate_writes_coalesce() {
    let mut bench = DramBench::new();
    bench.run(200);

    let ul = bench.upper.channel;
    for offset in [0u64, 8, 16] {
        let write = Request {
            address: 0x30_0000 + offset,
            v_address: 0x30_0000 + offset,
            kind: AccessType::Write,
            response_requested: false,
            ..Request::default()
        };
        assert!(bench.channels[ul].add_wq(write));
    }
    bench.run(2);

    assert_eq!(bench.mc.channels[0].wq_occupancy(), 1);
}
