//! Machine assembly and the simulation loop.
//!
//! The [`Machine`] owns every component and the channel arena that links
//! them, and drives the global clock. It provides:
//! 1. **Wiring:** One core, cache stack, TLB stack, and walker per trace,
//!    sharing a last-level cache and the memory controller.
//! 2. **Phases:** A warm-up pass with zeroed latencies, then the measured
//!    region, with statistics reset at the boundary.
//! 3. **Watchdog:** A progress counter that dumps every component and
//!    aborts when nothing moves for the configured window.
//! 4. **Heartbeat:** Periodic progress lines while the simulation runs.

use tracing::info;

use crate::cache::Cache;
use crate::channel::{ChannelId, Channels};
use crate::common::SimError;
use crate::config::Config;
use crate::core::OooCore;
use crate::memory::MemoryController;
use crate::ptw::PageTableWalker;
use crate::stats::Report;
use crate::trace::TraceReader;
use crate::vmem::VirtualMemory;

/// Per-CPU wiring handles, kept for tests and diagnostics.
struct CpuWiring {
    l1i_bus: ChannelId,
    l1d_bus: ChannelId,
    /// Index of this CPU's L1I in the cache list, for the branch hook.
    l1i_cache: usize,
}

/// The assembled machine.
pub struct Machine {
    channels: Channels,
    cores: Vec<OooCore>,
    /// Tick order: TLBs, L1s, L2s, STLBs, then the shared LLC.
    caches: Vec<Cache>,
    ptws: Vec<PageTableWalker>,
    dram: MemoryController,
    vmem: VirtualMemory,
    traces: Vec<TraceReader>,
    trace_done: Vec<bool>,
    wiring: Vec<CpuWiring>,
    deadlock_window: u64,
    current_cycle: u64,
}

impl Machine {
    /// Builds the machine: one core and private cache stack per trace, a
    /// shared LLC, and the DRAM controller behind it.
    pub fn new(config: &Config, traces: Vec<TraceReader>) -> Self {
        let num_cpus = traces.len();
        assert!(num_cpus > 0, "at least one trace is required");

        let mut channels = Channels::new();
        let mut cores = Vec::new();
        let mut upper_caches = Vec::new();
        let mut lower_caches = Vec::new();
        let mut ptws = Vec::new();
        let mut wiring = Vec::new();

        // The LLC and DRAM are shared; create their inbound channels first.
        let dram_ul = channels.create(config.dram.rq_size, 0, config.dram.wq_size, crate::common::LOG2_BLOCK_SIZE, false);
        let mut llc_uls = Vec::new();

        let dram = MemoryController::new(&config.dram, vec![dram_ul]);
        let mut vmem = VirtualMemory::new(&config.vmem, dram.size());

        for cpu in 0..num_cpus {
            let named = |base: &str| {
                let mut cache_config = match base {
                    "L1I" => config.l1i.clone(),
                    "L1D" => config.l1d.clone(),
                    "L2C" => config.l2c.clone(),
                    "ITLB" => config.itlb.clone(),
                    "DTLB" => config.dtlb.clone(),
                    "STLB" => config.stlb.clone(),
                    _ => unreachable!(),
                };
                cache_config.name = format!("cpu{}_{}", cpu, base);
                cache_config
            };

            let l1i_config = named("L1I");
            let l1d_config = named("L1D");
            let l2c_config = named("L2C");
            let itlb_config = named("ITLB");
            let dtlb_config = named("DTLB");
            let stlb_config = named("STLB");

            let mk_channel = |channels: &mut Channels, c: &crate::config::CacheConfig| {
                channels.create(c.rq_size, c.upstream_pq_size, c.wq_size, c.offset_bits, c.match_offset_bits)
            };

            // Channels are owned by their consumer; names follow the producer.
            let l1i_bus = mk_channel(&mut channels, &l1i_config);
            let l1d_core_bus = mk_channel(&mut channels, &l1d_config);
            let ptw_l1d_bus = mk_channel(&mut channels, &l1d_config);
            let itlb_bus = mk_channel(&mut channels, &itlb_config);
            let dtlb_bus = mk_channel(&mut channels, &dtlb_config);
            let l2_from_l1i = mk_channel(&mut channels, &l2c_config);
            let l2_from_l1d = mk_channel(&mut channels, &l2c_config);
            let stlb_from_itlb = mk_channel(&mut channels, &stlb_config);
            let stlb_from_dtlb = mk_channel(&mut channels, &stlb_config);
            let ptw_bus = channels.create(config.ptw.mshr_size, 0, 0, crate::common::LOG2_PAGE_SIZE, true);
            let llc_from_l2 = mk_channel(&mut channels, &config.llc);
            llc_uls.push(llc_from_l2);

            cores.push(OooCore::new(&config.core, cpu, l1i_bus, l1d_core_bus));
            wiring.push(CpuWiring {
                l1i_bus,
                l1d_bus: l1d_core_bus,
                // Uppers are pushed as [ITLB, DTLB, L1I, L1D] per CPU.
                l1i_cache: upper_caches.len() + 2,
            });

            // TLB stack.
            upper_caches.push(Cache::new(&itlb_config, vec![itlb_bus], stlb_from_itlb, None));
            upper_caches.push(Cache::new(&dtlb_config, vec![dtlb_bus], stlb_from_dtlb, None));

            // L1s translate through their TLBs.
            upper_caches.push(Cache::new(&l1i_config, vec![l1i_bus], l2_from_l1i, Some(itlb_bus)));
            upper_caches.push(Cache::new(&l1d_config, vec![l1d_core_bus, ptw_l1d_bus], l2_from_l1d, Some(dtlb_bus)));

            lower_caches.push(Cache::new(&l2c_config, vec![l2_from_l1i, l2_from_l1d], llc_from_l2, None));
            lower_caches.push(Cache::new(&stlb_config, vec![stlb_from_itlb, stlb_from_dtlb], ptw_bus, None));

            ptws.push(PageTableWalker::new(
                &format!("cpu{}_PTW", cpu),
                &config.ptw,
                cpu,
                &mut vmem,
                vec![ptw_bus],
                ptw_l1d_bus,
            ));
        }

        let mut caches = upper_caches;
        caches.append(&mut lower_caches);
        caches.push(Cache::new(&config.llc, llc_uls, dram_ul, None));

        for cache in &mut caches {
            cache.initialize();
        }
        for core in &mut cores {
            core.initialize();
        }

        let trace_done = vec![false; num_cpus];
        Self {
            channels,
            cores,
            caches,
            ptws,
            dram,
            vmem,
            traces,
            trace_done,
            wiring,
            deadlock_window: config.deadlock_window,
            current_cycle: 0,
        }
    }

    fn set_warmup(&mut self, warmup: bool) {
        for core in &mut self.cores {
            core.warmup = warmup;
        }
        for cache in &mut self.caches {
            cache.warmup = warmup;
        }
        for ptw in &mut self.ptws {
            ptw.warmup = warmup;
        }
        self.dram.set_warmup(warmup);
    }

    /// Reads trace records into each core's input queue.
    fn refill_input_queues(&mut self) -> Result<(), SimError> {
        for (cpu, core) in self.cores.iter_mut().enumerate() {
            if self.trace_done[cpu] {
                continue;
            }
            while core.input_queue_has_room() {
                match self.traces[cpu].next_instr()? {
                    Some(instr) => core.input_queue.push_back(instr),
                    None => {
                        self.trace_done[cpu] = true;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Advances the global clock one cycle, ticking every due component.
    /// Returns the total progress reported.
    fn tick(&mut self) -> u64 {
        self.current_cycle += 1;
        let now = self.current_cycle;
        let mut progress = 0;

        for (cpu, core) in self.cores.iter_mut().enumerate() {
            if core.clock.try_tick(now) {
                progress += core.operate(&mut self.channels);
                // Control flow feeds the instruction prefetcher.
                for (ip, branch_type, target) in core.branch_events.drain(..) {
                    self.caches[self.wiring[cpu].l1i_cache].prefetcher_branch_operate(ip, branch_type, target);
                }
            }
        }
        for cache in &mut self.caches {
            if cache.clock.try_tick(now) {
                progress += cache.operate(&mut self.channels);
            }
        }
        for ptw in &mut self.ptws {
            if ptw.clock.try_tick(now) {
                progress += ptw.operate(&mut self.channels, &mut self.vmem);
            }
        }
        if self.dram.clock.try_tick(now) {
            progress += self.dram.operate(&mut self.channels);
        }

        progress
    }

    fn dump_deadlock(&self) {
        for core in &self.cores {
            core.print_deadlock();
        }
        for cache in &self.caches {
            cache.print_deadlock(&self.channels);
        }
        for ptw in &self.ptws {
            ptw.print_deadlock();
        }
        self.dram.print_deadlock();
    }

    fn run_phase(
        &mut self,
        goal_instructions: u64,
        heartbeat: u64,
        warmup: bool,
    ) -> Result<(), SimError> {
        let mut idle_cycles = 0u64;
        let mut next_heartbeat: Vec<u64> = self.cores.iter().map(|c| c.sim_instr() + heartbeat).collect();

        loop {
            let finished = self
                .cores
                .iter()
                .enumerate()
                .all(|(cpu, core)| core.sim_instr() >= goal_instructions || self.trace_done[cpu]);
            if finished {
                return Ok(());
            }

            // A trace that ends during warm-up cannot produce a valid run.
            if warmup {
                for (cpu, &done) in self.trace_done.iter().enumerate() {
                    if done && self.cores[cpu].sim_instr() < goal_instructions {
                        return Err(SimError::TraceExhausted {
                            cpu,
                            read: self.traces[cpu].records_read,
                            wanted: goal_instructions,
                        });
                    }
                }
            }

            self.refill_input_queues()?;
            let progress = self.tick();

            if progress == 0 {
                idle_cycles += 1;
                if idle_cycles >= self.deadlock_window {
                    self.dump_deadlock();
                    return Err(SimError::Deadlock {
                        cycle: self.current_cycle,
                    });
                }
            } else {
                idle_cycles = 0;
            }

            if !warmup && heartbeat > 0 {
                for (cpu, core) in self.cores.iter().enumerate() {
                    if core.sim_instr() >= next_heartbeat[cpu] {
                        let ipc = core.sim_instr() as f64 / core.sim_cycle().max(1) as f64;
                        println!(
                            "Heartbeat CPU {} instructions: {} cycles: {} cumulative IPC: {:.4}",
                            cpu,
                            core.sim_instr(),
                            core.sim_cycle(),
                            ipc
                        );
                        next_heartbeat[cpu] += heartbeat;
                    }
                }
            }
        }
    }

    /// Runs warm-up then the measured region.
    pub fn run(
        &mut self,
        warmup_instructions: u64,
        simulation_instructions: u64,
        heartbeat_instructions: u64,
    ) -> Result<Report, SimError> {
        info!(warmup_instructions, simulation_instructions, "simulation start");

        self.set_warmup(true);
        for core in &mut self.cores {
            core.begin_phase();
        }
        self.run_phase(warmup_instructions, 0, true)?;

        // Measured region: reset statistics, restore real latencies.
        self.set_warmup(false);
        for core in &mut self.cores {
            core.begin_phase();
        }
        for cache in &mut self.caches {
            cache.begin_phase();
        }
        for chan in &mut self.dram.channels {
            chan.stats = crate::stats::DramChannelStats {
                name: chan.stats.name.clone(),
                ..Default::default()
            };
        }
        self.run_phase(simulation_instructions, heartbeat_instructions, false)?;

        for core in &mut self.cores {
            core.end_phase();
        }
        for cache in &mut self.caches {
            cache.final_stats();
        }
        info!(cycle = self.current_cycle, "simulation end");
        Ok(self.report())
    }

    /// Snapshots all statistics accumulated so far.
    pub fn report(&self) -> Report {
        Report {
            cores: self.cores.iter().map(|c| {
                let mut stats = c.stats.clone();
                stats.end_instrs = c.num_retired;
                stats.end_cycles = stats.end_cycles.max(c.stats.begin_cycles + c.sim_cycle());
                stats
            }).collect(),
            caches: self.caches.iter().map(|c| c.stats.clone()).collect(),
            dram_channels: self.dram.channels.iter().map(|c| c.stats.clone()).collect(),
        }
    }

    /// The core's L1I channel, for tests and diagnostics.
    pub fn l1i_bus(&self, cpu: usize) -> ChannelId {
        self.wiring[cpu].l1i_bus
    }

    /// The core's L1D channel, for tests and diagnostics.
    pub fn l1d_bus(&self, cpu: usize) -> ChannelId {
        self.wiring[cpu].l1d_bus
    }

    /// Global cycle count.
    pub fn current_cycle(&self) -> u64 {
        self.current_cycle
    }
}
