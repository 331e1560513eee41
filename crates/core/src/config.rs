//! Configuration system for the simulator.
//!
//! This module defines all configuration structures and enums used to
//! parameterize a simulated machine. It provides:
//! 1. **Defaults:** Baseline hardware constants (core widths, cache geometry,
//!    DRAM timing).
//! 2. **Structures:** Hierarchical config for the core, each cache level, the
//!    page-table walker, and the memory controller.
//! 3. **Enums:** Replacement policy, prefetcher, branch predictor, and BTB
//!    selection.
//!
//! Configuration deserializes from JSON; `Config::default()` models a single
//! modern out-of-order core over a three-level cache hierarchy.

use serde::Deserialize;

use crate::common::AccessType;

/// Default configuration constants.
///
/// These values parameterize the default machine when not overridden.
mod defaults {
    /// Reorder buffer capacity.
    pub const ROB_SIZE: usize = 352;

    /// Load queue capacity.
    pub const LQ_SIZE: usize = 128;

    /// Store queue capacity.
    pub const SQ_SIZE: usize = 72;

    /// Instruction fetch buffer capacity.
    pub const IFETCH_BUFFER_SIZE: usize = 64;

    /// Decode buffer capacity.
    pub const DECODE_BUFFER_SIZE: usize = 32;

    /// Dispatch buffer capacity.
    pub const DISPATCH_BUFFER_SIZE: usize = 32;

    /// Instructions fetched per cycle.
    pub const FETCH_WIDTH: usize = 6;

    /// Instructions decoded per cycle.
    pub const DECODE_WIDTH: usize = 6;

    /// Instructions dispatched into the ROB per cycle.
    pub const DISPATCH_WIDTH: usize = 6;

    /// ROB entries examined by the schedulers per cycle.
    pub const SCHEDULE_WIDTH: usize = 128;

    /// Instructions entering execution per cycle.
    pub const EXEC_WIDTH: usize = 4;

    /// Loads issued to the L1D per cycle.
    pub const LQ_WIDTH: usize = 2;

    /// Stores issued to the L1D per cycle.
    pub const SQ_WIDTH: usize = 2;

    /// Instructions retired per cycle.
    pub const RETIRE_WIDTH: usize = 5;

    /// Cycles between a mispredicted branch's retirement and fetch resume.
    pub const MISPREDICT_PENALTY: u64 = 1;

    /// Decode latency in cycles.
    pub const DECODE_LATENCY: u64 = 1;

    /// Dispatch latency in cycles.
    pub const DISPATCH_LATENCY: u64 = 1;

    /// Scheduling latency in cycles.
    pub const SCHEDULE_LATENCY: u64 = 0;

    /// Execution latency in cycles.
    pub const EXEC_LATENCY: u64 = 0;

    /// Cache-line fetch requests to the L1I per cycle.
    pub const L1I_BANDWIDTH: usize = 1;

    /// Responses drained from the L1D per cycle.
    pub const L1D_BANDWIDTH: usize = 1;

    /// Decoded instruction buffer geometry.
    pub const DIB_SETS: usize = 32;
    pub const DIB_WAYS: usize = 8;
    /// Instruction window covered by one DIB entry, in bytes.
    pub const DIB_WINDOW: u64 = 16;

    /// Page-table levels of the virtual memory model.
    pub const PT_LEVELS: usize = 5;

    /// Cycles charged for a minor page fault (first touch of a page).
    pub const MINOR_FAULT_PENALTY: u64 = 200;

    /// DRAM I/O frequency in MHz.
    pub const DRAM_IO_FREQ: u64 = 3200;

    /// DRAM geometry.
    pub const DRAM_CHANNELS: usize = 1;
    pub const DRAM_RANKS: usize = 1;
    pub const DRAM_BANKS: usize = 8;
    pub const DRAM_ROWS: usize = 65536;
    pub const DRAM_COLUMNS: usize = 128;

    /// Data bus width in bytes.
    pub const DRAM_CHANNEL_WIDTH: u64 = 8;

    /// DRAM timing in nanoseconds.
    pub const T_RP_NS: f64 = 12.5;
    pub const T_RCD_NS: f64 = 12.5;
    pub const T_CAS_NS: f64 = 12.5;
    pub const DBUS_TURNAROUND_NS: f64 = 7.5;

    /// DRAM queue capacities.
    pub const DRAM_RQ_SIZE: usize = 64;
    pub const DRAM_WQ_SIZE: usize = 64;

    /// Progress-free cycles tolerated before declaring deadlock.
    pub const DEADLOCK_WINDOW: u64 = 500;
}

/// Cache replacement policy selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementKind {
    /// Least recently used.
    #[default]
    Lru,
    /// Static re-reference interval prediction.
    Srrip,
    /// Uniform random victim selection.
    Random,
}

/// Hardware prefetcher selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetcherKind {
    /// No prefetching.
    #[default]
    None,
    /// Prefetch the next sequential block on every activation.
    NextLine,
    /// Detect constant strides per instruction pointer.
    IpStride,
}

/// Branch direction predictor selection.
///
/// A core may compose several predictors. Every predictor in the list is
/// queried and trained on each branch; the verdict of the *last* entry
/// decides the predicted direction, so order matters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPredictorKind {
    /// Table of 2-bit saturating counters indexed by ip.
    Bimodal,
    /// Global-history-xor-ip indexed counter table.
    Gshare,
}

/// Branch target buffer selection. Composition follows the same
/// last-entry-wins rule as direction predictors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BtbKind {
    /// Direct-mapped target table with a return address stack.
    Basic,
}

/// Root configuration for one simulated machine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Out-of-order core parameters.
    pub core: CoreConfig,
    /// First-level instruction cache.
    pub l1i: CacheConfig,
    /// First-level data cache.
    pub l1d: CacheConfig,
    /// Unified second-level cache.
    pub l2c: CacheConfig,
    /// Last-level cache.
    pub llc: CacheConfig,
    /// Instruction TLB.
    pub itlb: CacheConfig,
    /// Data TLB.
    pub dtlb: CacheConfig,
    /// Second-level TLB.
    pub stlb: CacheConfig,
    /// Page-table walker parameters.
    pub ptw: PtwConfig,
    /// Virtual memory model parameters.
    pub vmem: VmemConfig,
    /// Memory controller and DRAM channel parameters.
    pub dram: DramConfig,
    /// Progress-free cycles tolerated before the watchdog declares deadlock.
    pub deadlock_window: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            l1i: CacheConfig {
                name: "cpu0_L1I".into(),
                sets: 64,
                ways: 8,
                mshr_size: 8,
                hit_latency: 3,
                fill_latency: 1,
                max_tag: 2,
                max_fill: 2,
                pq_size: 32,
                prefetch_as_load: false,
                virtual_prefetch: true,
                pref_activate: vec![AccessType::Load, AccessType::Prefetch],
                prefetcher: PrefetcherKind::None,
                ..CacheConfig::default()
            },
            l1d: CacheConfig {
                name: "cpu0_L1D".into(),
                sets: 64,
                ways: 12,
                mshr_size: 16,
                hit_latency: 4,
                fill_latency: 1,
                max_tag: 2,
                max_fill: 2,
                pq_size: 8,
                ..CacheConfig::default()
            },
            l2c: CacheConfig {
                name: "cpu0_L2C".into(),
                sets: 1024,
                ways: 8,
                mshr_size: 32,
                hit_latency: 9,
                fill_latency: 1,
                max_tag: 1,
                max_fill: 1,
                pq_size: 16,
                ..CacheConfig::default()
            },
            llc: CacheConfig {
                name: "LLC".into(),
                sets: 2048,
                ways: 16,
                mshr_size: 64,
                hit_latency: 19,
                fill_latency: 1,
                max_tag: 1,
                max_fill: 1,
                pq_size: 32,
                ..CacheConfig::default()
            },
            itlb: CacheConfig::tlb("cpu0_ITLB", 16, 4, 1),
            dtlb: CacheConfig::tlb("cpu0_DTLB", 16, 4, 1),
            stlb: CacheConfig::tlb("cpu0_STLB", 128, 12, 7),
            ptw: PtwConfig::default(),
            vmem: VmemConfig::default(),
            dram: DramConfig::default(),
            deadlock_window: defaults::DEADLOCK_WINDOW,
        }
    }
}

/// Out-of-order core parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Reorder buffer capacity.
    pub rob_size: usize,
    /// Load queue capacity.
    pub lq_size: usize,
    /// Store queue capacity.
    pub sq_size: usize,
    /// Instruction fetch buffer capacity.
    pub ifetch_buffer_size: usize,
    /// Decode buffer capacity.
    pub decode_buffer_size: usize,
    /// Dispatch buffer capacity.
    pub dispatch_buffer_size: usize,
    /// Instructions read from the trace per cycle.
    pub fetch_width: usize,
    /// Instructions decoded per cycle.
    pub decode_width: usize,
    /// Instructions dispatched per cycle.
    pub dispatch_width: usize,
    /// ROB entries examined by the schedulers per cycle.
    pub schedule_width: usize,
    /// Instructions entering execution per cycle.
    pub exec_width: usize,
    /// Loads issued per cycle.
    pub lq_width: usize,
    /// Stores issued per cycle.
    pub sq_width: usize,
    /// Instructions retired per cycle.
    pub retire_width: usize,
    /// Cycles between a mispredicted branch's retirement and fetch resume.
    pub mispredict_penalty: u64,
    /// Decode latency in cycles.
    pub decode_latency: u64,
    /// Dispatch latency in cycles.
    pub dispatch_latency: u64,
    /// Scheduling latency in cycles.
    pub schedule_latency: u64,
    /// Execution latency in cycles.
    pub exec_latency: u64,
    /// Cache-line fetch requests to the L1I per cycle.
    pub l1i_bandwidth: usize,
    /// Responses drained from the L1D per cycle.
    pub l1d_bandwidth: usize,
    /// Decoded instruction buffer sets.
    pub dib_sets: usize,
    /// Decoded instruction buffer ways.
    pub dib_ways: usize,
    /// Bytes of instruction window covered by one DIB entry.
    pub dib_window: u64,
    /// Branch predictors, queried in order; the last entry's verdict wins.
    pub branch_predictors: Vec<BranchPredictorKind>,
    /// Branch target buffers, queried in order; the last entry's verdict wins.
    pub btbs: Vec<BtbKind>,
    /// Core clock period in global cycles.
    pub clock_period: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            rob_size: defaults::ROB_SIZE,
            lq_size: defaults::LQ_SIZE,
            sq_size: defaults::SQ_SIZE,
            ifetch_buffer_size: defaults::IFETCH_BUFFER_SIZE,
            decode_buffer_size: defaults::DECODE_BUFFER_SIZE,
            dispatch_buffer_size: defaults::DISPATCH_BUFFER_SIZE,
            fetch_width: defaults::FETCH_WIDTH,
            decode_width: defaults::DECODE_WIDTH,
            dispatch_width: defaults::DISPATCH_WIDTH,
            schedule_width: defaults::SCHEDULE_WIDTH,
            exec_width: defaults::EXEC_WIDTH,
            lq_width: defaults::LQ_WIDTH,
            sq_width: defaults::SQ_WIDTH,
            retire_width: defaults::RETIRE_WIDTH,
            mispredict_penalty: defaults::MISPREDICT_PENALTY,
            decode_latency: defaults::DECODE_LATENCY,
            dispatch_latency: defaults::DISPATCH_LATENCY,
            schedule_latency: defaults::SCHEDULE_LATENCY,
            exec_latency: defaults::EXEC_LATENCY,
            l1i_bandwidth: defaults::L1I_BANDWIDTH,
            l1d_bandwidth: defaults::L1D_BANDWIDTH,
            dib_sets: defaults::DIB_SETS,
            dib_ways: defaults::DIB_WAYS,
            dib_window: defaults::DIB_WINDOW,
            branch_predictors: vec![BranchPredictorKind::Bimodal],
            btbs: vec![BtbKind::Basic],
            clock_period: 1,
        }
    }
}

/// Parameters of one cache level. Fixed at construction.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Display name, used in statistics and deadlock dumps.
    pub name: String,
    /// Number of sets (power of two).
    pub sets: usize,
    /// Associativity.
    pub ways: usize,
    /// Outstanding-miss capacity.
    pub mshr_size: usize,
    /// Internal prefetch queue capacity.
    pub pq_size: usize,
    /// Upstream channel read queue capacity.
    pub rq_size: usize,
    /// Upstream channel write queue capacity.
    pub wq_size: usize,
    /// Upstream channel prefetch queue capacity.
    pub upstream_pq_size: usize,
    /// Cycles from tag-check admission to hit resolution.
    pub hit_latency: u64,
    /// Cycles from a lower-level response to the block fill.
    pub fill_latency: u64,
    /// Tag checks resolved per cycle.
    pub max_tag: usize,
    /// Fills performed per cycle.
    pub max_fill: usize,
    /// log2 of the block size covered by the tag.
    pub offset_bits: u32,
    /// Forward local prefetches on the read queue instead of the prefetch queue.
    pub prefetch_as_load: bool,
    /// Operate the prefetcher on virtual addresses.
    pub virtual_prefetch: bool,
    /// Include the offset bits in the tag (TLB behavior).
    pub match_offset_bits: bool,
    /// Access types that activate the prefetcher.
    pub pref_activate: Vec<AccessType>,
    /// Replacement policy.
    pub replacement: ReplacementKind,
    /// Prefetcher.
    pub prefetcher: PrefetcherKind,
    /// Clock period in global cycles.
    pub clock_period: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            sets: 64,
            ways: 8,
            mshr_size: 8,
            pq_size: 8,
            rq_size: 32,
            wq_size: 32,
            upstream_pq_size: 32,
            hit_latency: 1,
            fill_latency: 1,
            max_tag: 1,
            max_fill: 1,
            offset_bits: crate::common::LOG2_BLOCK_SIZE,
            prefetch_as_load: false,
            virtual_prefetch: false,
            match_offset_bits: false,
            pref_activate: vec![AccessType::Load, AccessType::Prefetch],
            replacement: ReplacementKind::Lru,
            prefetcher: PrefetcherKind::None,
            clock_period: 1,
        }
    }
}

impl CacheConfig {
    /// A TLB configuration: page-granular tags that include the offset bits.
    pub fn tlb(name: &str, sets: usize, ways: usize, hit_latency: u64) -> Self {
        Self {
            name: name.into(),
            sets,
            ways,
            mshr_size: 8,
            pq_size: 0,
            hit_latency,
            fill_latency: 1,
            max_tag: 2,
            max_fill: 2,
            offset_bits: crate::common::LOG2_PAGE_SIZE,
            match_offset_bits: true,
            pref_activate: Vec::new(),
            ..Self::default()
        }
    }
}

/// Page-table walker parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PtwConfig {
    /// Outstanding-walk capacity.
    pub mshr_size: usize,
    /// Requests accepted per cycle.
    pub max_read: usize,
    /// Walk steps finished per cycle.
    pub max_fill: usize,
    /// Cycles added to each finished walk step.
    pub hit_latency: u64,
    /// Partial-translation cache dimensions, one `(sets, ways)` per
    /// intermediate level, deepest (closest to the leaf) level first.
    pub pscl: Vec<(usize, usize)>,
}

impl Default for PtwConfig {
    fn default() -> Self {
        Self {
            mshr_size: 5,
            max_read: 2,
            max_fill: 2,
            hit_latency: 1,
            pscl: vec![(4, 8), (2, 4), (1, 4), (1, 2)],
        }
    }
}

/// Virtual memory model parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VmemConfig {
    /// Page-table depth.
    pub levels: usize,
    /// Cycles charged on the first touch of a virtual page.
    pub minor_fault_penalty: u64,
    /// Seed for physical page assignment.
    pub seed: u64,
}

impl Default for VmemConfig {
    fn default() -> Self {
        Self {
            levels: defaults::PT_LEVELS,
            minor_fault_penalty: defaults::MINOR_FAULT_PENALTY,
            seed: 0xcafe,
        }
    }
}

/// Memory controller and DRAM channel parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DramConfig {
    /// I/O frequency in MHz.
    pub io_freq: u64,
    /// Channel count (power of two).
    pub channels: usize,
    /// Ranks per channel.
    pub ranks: usize,
    /// Banks per rank.
    pub banks: usize,
    /// Rows per bank.
    pub rows: usize,
    /// Columns per row.
    pub columns: usize,
    /// Data bus width in bytes.
    pub channel_width: u64,
    /// Row precharge time in nanoseconds.
    pub t_rp_ns: f64,
    /// Row activation time in nanoseconds.
    pub t_rcd_ns: f64,
    /// Column access time in nanoseconds.
    pub t_cas_ns: f64,
    /// Bus turnaround time in nanoseconds.
    pub turnaround_ns: f64,
    /// Read queue slots per channel.
    pub rq_size: usize,
    /// Write queue slots per channel.
    pub wq_size: usize,
    /// Write queue occupancy that enters write mode.
    pub write_high_wm: usize,
    /// Write queue occupancy that leaves write mode.
    pub write_low_wm: usize,
    /// Channel clock period in global cycles.
    pub clock_period: u64,
}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            io_freq: defaults::DRAM_IO_FREQ,
            channels: defaults::DRAM_CHANNELS,
            ranks: defaults::DRAM_RANKS,
            banks: defaults::DRAM_BANKS,
            rows: defaults::DRAM_ROWS,
            columns: defaults::DRAM_COLUMNS,
            channel_width: defaults::DRAM_CHANNEL_WIDTH,
            t_rp_ns: defaults::T_RP_NS,
            t_rcd_ns: defaults::T_RCD_NS,
            t_cas_ns: defaults::T_CAS_NS,
            turnaround_ns: defaults::DBUS_TURNAROUND_NS,
            rq_size: defaults::DRAM_RQ_SIZE,
            wq_size: defaults::DRAM_WQ_SIZE,
            write_high_wm: defaults::DRAM_WQ_SIZE * 7 / 8,
            write_low_wm: defaults::DRAM_WQ_SIZE * 6 / 8,
            clock_period: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hierarchy_is_consistent() {
        let config = Config::default();
        assert!(config.l1i.sets.is_power_of_two());
        assert!(config.llc.sets.is_power_of_two());
        assert!(config.dram.channels.is_power_of_two());
        assert!(config.dram.write_low_wm < config.dram.write_high_wm);
        assert!(!config.core.branch_predictors.is_empty());
    }

    #[test]
    fn test_tlb_config_matches_offset_bits() {
        let config = Config::default();
        assert!(config.itlb.match_offset_bits);
        assert_eq!(config.stlb.offset_bits, crate::common::LOG2_PAGE_SIZE);
    }
}
