//! Simulation statistics collection and reporting.
//!
//! This module tracks the metrics the simulator exists to produce. It
//! provides:
//! 1. **Core:** Retired instructions, cycles, IPC, branch mix, and
//!    misprediction rates.
//! 2. **Caches:** Per-access-type hit/miss counts, prefetch effectiveness,
//!    and average miss latency.
//! 3. **DRAM:** Row-buffer hits/misses, bus congestion, and refresh activity.
//! 4. **Output:** Formatted text report and JSON serialization.

use serde::Serialize;

use crate::common::{AccessType, NUM_ACCESS_TYPES};
use crate::core::instruction::{BranchType, NUM_BRANCH_TYPES};

/// Statistics kept by one out-of-order core.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CoreStats {
    pub name: String,
    /// Retired instruction count at phase begin.
    pub begin_instrs: u64,
    /// Cycle count at phase begin.
    pub begin_cycles: u64,
    /// Retired instruction count at phase end.
    pub end_instrs: u64,
    /// Cycle count at phase end.
    pub end_cycles: u64,
    /// Sum of ROB occupancy sampled at each mispredicted branch.
    pub total_rob_occupancy_at_branch_mispredict: u64,
    /// Branches retired, by class.
    pub total_branch_types: [u64; NUM_BRANCH_TYPES],
    /// Mispredictions, by class.
    pub branch_type_misses: [u64; NUM_BRANCH_TYPES],
}

impl CoreStats {
    /// Instructions retired in the measured phase.
    pub fn instrs(&self) -> u64 {
        self.end_instrs - self.begin_instrs
    }

    /// Cycles elapsed in the measured phase.
    pub fn cycles(&self) -> u64 {
        self.end_cycles - self.begin_cycles
    }

    fn ipc(&self) -> f64 {
        self.instrs() as f64 / self.cycles().max(1) as f64
    }
}

/// Statistics kept by one cache level.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub name: String,
    /// Hits, indexed by access type.
    pub hits: [u64; NUM_ACCESS_TYPES],
    /// Misses, indexed by access type.
    pub misses: [u64; NUM_ACCESS_TYPES],
    /// Prefetches requested by the prefetcher.
    pub pf_requested: u64,
    /// Prefetches admitted to the internal prefetch queue.
    pub pf_issued: u64,
    /// Prefetched blocks later touched by demand accesses.
    pub pf_useful: u64,
    /// Prefetched blocks evicted untouched.
    pub pf_useless: u64,
    /// Fills whose request was a prefetch.
    pub pf_fill: u64,
    /// Sum of per-fill miss latencies.
    pub total_miss_latency: u64,
}

impl CacheStats {
    /// Records a tag-check hit.
    #[inline]
    pub fn record_hit(&mut self, kind: AccessType) {
        self.hits[kind as usize] += 1;
    }

    /// Records a tag-check miss.
    #[inline]
    pub fn record_miss(&mut self, kind: AccessType) {
        self.misses[kind as usize] += 1;
    }

    /// Total misses across access types.
    pub fn total_misses(&self) -> u64 {
        self.misses.iter().sum()
    }

    /// Average cycles from miss to fill.
    pub fn avg_miss_latency(&self) -> f64 {
        self.total_miss_latency as f64 / self.total_misses().max(1) as f64
    }
}

/// Statistics kept by one DRAM channel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DramChannelStats {
    pub name: String,
    /// Reads serviced out of an already-open row.
    pub rq_row_buffer_hit: u64,
    /// Reads that had to open their row.
    pub rq_row_buffer_miss: u64,
    /// Writes serviced out of an already-open row.
    pub wq_row_buffer_hit: u64,
    /// Writes that had to open their row.
    pub wq_row_buffer_miss: u64,
    /// Write enqueues refused because the write queue was full.
    pub wq_full: u64,
    /// Cycles a ready request waited for the data bus.
    pub dbus_cycle_congested: u64,
    /// Requests that found the data bus busy.
    pub dbus_count_congested: u64,
    /// Refresh bursts issued.
    pub refresh_cycles: u64,
}

/// The complete report for one run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Report {
    pub cores: Vec<CoreStats>,
    pub caches: Vec<CacheStats>,
    pub dram_channels: Vec<DramChannelStats>,
}

impl Report {
    /// Prints the full report to stdout.
    pub fn print(&self) {
        println!("\n==========================================================");
        println!("SIMULATION STATISTICS");
        println!("==========================================================");

        for core in &self.cores {
            println!("{}", core.name);
            println!("  instructions           {}", core.instrs());
            println!("  cycles                 {}", core.cycles());
            println!("  ipc                    {:.4}", core.ipc());

            let branches: u64 = core.total_branch_types.iter().skip(1).sum();
            let misses: u64 = core.branch_type_misses.iter().sum();
            let accuracy = if branches > 0 {
                100.0 * (branches.saturating_sub(misses)) as f64 / branches as f64
            } else {
                100.0
            };
            let mpki = 1000.0 * misses as f64 / core.instrs().max(1) as f64;
            println!("  branch accuracy        {:.4}% MPKI: {:.4}", accuracy, mpki);
            if misses > 0 {
                println!(
                    "  avg ROB occupancy at mispredict: {:.4}",
                    core.total_rob_occupancy_at_branch_mispredict as f64 / misses as f64
                );
            }
            for (i, name) in BranchType::NAMES.iter().enumerate().skip(1) {
                if core.total_branch_types[i] > 0 {
                    println!(
                        "    {:<22} {} ({} misses)",
                        name, core.total_branch_types[i], core.branch_type_misses[i]
                    );
                }
            }
            println!("----------------------------------------------------------");
        }

        for cache in &self.caches {
            let total_hits: u64 = cache.hits.iter().sum();
            let total_misses = cache.total_misses();
            println!(
                "{:<10} TOTAL        accesses: {:<10} hits: {:<10} misses: {}",
                cache.name,
                total_hits + total_misses,
                total_hits,
                total_misses
            );
            for kind in AccessType::ALL {
                let hits = cache.hits[kind as usize];
                let misses = cache.misses[kind as usize];
                if hits + misses > 0 {
                    println!(
                        "{:<10} {:<12} accesses: {:<10} hits: {:<10} misses: {}",
                        cache.name,
                        kind.name(),
                        hits + misses,
                        hits,
                        misses
                    );
                }
            }
            if cache.pf_issued > 0 {
                println!(
                    "{:<10} PREFETCH requested: {} issued: {} useful: {} useless: {}",
                    cache.name, cache.pf_requested, cache.pf_issued, cache.pf_useful, cache.pf_useless
                );
            }
            println!(
                "{:<10} AVERAGE MISS LATENCY: {:.4} cycles",
                cache.name,
                cache.avg_miss_latency()
            );
            println!("----------------------------------------------------------");
        }

        for chan in &self.dram_channels {
            println!("{}", chan.name);
            println!(
                "  RQ row buffer hit      {:<10} row buffer miss: {}",
                chan.rq_row_buffer_hit, chan.rq_row_buffer_miss
            );
            println!(
                "  WQ row buffer hit      {:<10} row buffer miss: {} full: {}",
                chan.wq_row_buffer_hit, chan.wq_row_buffer_miss, chan.wq_full
            );
            let avg_congestion = if chan.dbus_count_congested > 0 {
                chan.dbus_cycle_congested as f64 / chan.dbus_count_congested as f64
            } else {
                0.0
            };
            println!("  AVG DBUS CONGESTED CYCLE: {:.4}", avg_congestion);
            println!("  refresh bursts         {}", chan.refresh_cycles);
            println!("----------------------------------------------------------");
        }
        println!("==========================================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_miss_latency_no_divide_by_zero() {
        let stats = CacheStats::default();
        assert_eq!(stats.avg_miss_latency(), 0.0);
    }

    #[test]
    fn test_core_phase_deltas() {
        let stats = CoreStats {
            begin_instrs: 100,
            end_instrs: 300,
            begin_cycles: 1000,
            end_cycles: 2000,
            ..CoreStats::default()
        };
        assert_eq!(stats.instrs(), 200);
        assert_eq!(stats.cycles(), 1000);
        assert!((stats.ipc() - 0.2).abs() < 1e-9);
    }
}
