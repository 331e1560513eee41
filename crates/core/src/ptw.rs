//! Hardware page-table walker.
//!
//! Translation requests arrive on the walker's upper channels (from the
//! second-level TLB), and each walk descends the page table by issuing
//! Translation-type reads to the data cache hierarchy. It provides:
//! 1. **PSCLs:** One partial-translation cache per intermediate level,
//!    letting a walk skip the levels it has seen before.
//! 2. **Budgeted stepping:** `MAX_READ` new walks and `MAX_FILL` finished
//!    steps per cycle, with per-step ready times.
//! 3. **Completion:** The final level resolves through the virtual-memory
//!    model and returns the physical page to the requester.

use tracing::debug;

use crate::channel::{ChannelId, Channels, Request, Response};
use crate::common::{AccessType, LOG2_BLOCK_SIZE, LruTable, PTE_BYTES};
use crate::config::PtwConfig;
use crate::operable::Operable;
use crate::vmem::VirtualMemory;

/// An in-flight walk step.
#[derive(Clone, Debug)]
struct WalkEntry {
    /// Physical address of the PTE being read.
    address: u64,
    /// The virtual address being translated.
    v_address: u64,
    /// PTE address for the next step, or the final physical address.
    data: u64,
    cpu: usize,
    asid: [u8; 2],
    pf_metadata: u32,
    /// Levels left after this read; 0 reads the leaf PTE.
    translation_level: usize,
    instr_depend_on_me: Vec<u64>,
    to_return: Vec<ChannelId>,
}

/// A walk step waiting out its latency.
#[derive(Clone, Debug)]
struct Waitable {
    entry: WalkEntry,
    ready_at: u64,
}

/// The page-table walker.
pub struct PageTableWalker {
    pub name: String,
    pub clock: Operable,

    upper_levels: Vec<ChannelId>,
    lower_level: ChannelId,

    mshr_size: usize,
    max_read: usize,
    max_fill: usize,
    hit_latency: u64,

    /// `pscl[k-1]` caches jumps past level `k`; deepest first when probing.
    pscl: Vec<LruTable<u64>>,
    cpu: usize,
    cr3_addr: u64,

    /// Reads issued below, awaiting their response.
    mshr: Vec<WalkEntry>,
    /// Intermediate steps waiting out their latency.
    finished: Vec<Waitable>,
    /// Final steps waiting out their latency.
    completed: Vec<Waitable>,

    pub warmup: bool,
    current_cycle: u64,
}

impl PageTableWalker {
    /// Builds the walker for one CPU.
    pub fn new(
        name: &str,
        config: &PtwConfig,
        cpu: usize,
        vmem: &mut VirtualMemory,
        upper_levels: Vec<ChannelId>,
        lower_level: ChannelId,
    ) -> Self {
        let intermediate_levels = vmem.levels() - 1;
        assert_eq!(
            config.pscl.len(),
            intermediate_levels,
            "{}: one PSCL per intermediate translation level",
            name
        );
        // The deepest level's cache is probed first; config lists them in
        // that order.
        let pscl = config
            .pscl
            .iter()
            .enumerate()
            .map(|(i, &(sets, ways))| LruTable::new(sets, ways, vmem.shamt(i + 1)))
            .collect();
        Self {
            name: name.to_string(),
            clock: Operable::new(1),
            upper_levels,
            lower_level,
            mshr_size: config.mshr_size,
            max_read: config.max_read,
            max_fill: config.max_fill,
            hit_latency: config.hit_latency,
            pscl,
            cpu,
            cr3_addr: vmem.cr3(cpu),
            mshr: Vec::new(),
            finished: Vec::new(),
            completed: Vec::new(),
            warmup: false,
            current_cycle: 0,
        }
    }

    /// One clock edge.
    pub fn operate(&mut self, channels: &mut Channels, vmem: &mut VirtualMemory) -> u64 {
        self.current_cycle += 1;
        let now = self.current_cycle;
        let mut progress = 0u64;

        // Sort responses into finished/completed pools.
        while let Some(response) = channels[self.lower_level].returned.pop_front() {
            self.finish_packet(&response, vmem, now);
            progress += 1;
        }

        // Answer completed translations.
        let mut fill_bw = self.max_fill;
        while fill_bw > 0 {
            let Some(front) = self.completed.first() else { break };
            if front.ready_at > now {
                break;
            }
            let done = self.completed.remove(0);
            let response = Response {
                address: done.entry.v_address,
                v_address: done.entry.v_address,
                data: done.entry.data,
                pf_metadata: done.entry.pf_metadata,
                instr_depend_on_me: done.entry.instr_depend_on_me.clone(),
            };
            channels.push_response(&done.entry.to_return, &response);
            fill_bw -= 1;
            progress += 1;
        }

        // Step finished intermediate reads down a level.
        while fill_bw > 0 {
            let Some(front) = self.finished.first() else { break };
            if front.ready_at > now {
                break;
            }
            let step = self.finished[0].clone();
            if !self.handle_fill(&step.entry, channels) {
                break;
            }
            self.finished.remove(0);
            fill_bw -= 1;
            progress += 1;
        }

        // Accept new translation requests.
        let mut read_bw = self.max_read;
        for i in 0..self.upper_levels.len() {
            let ul = self.upper_levels[i];
            while read_bw > 0 {
                let Some(front) = channels[ul].rq.front().cloned() else { break };
                if !self.handle_read(&front, ul, channels, vmem) {
                    break;
                }
                channels[ul].rq.pop_front();
                read_bw -= 1;
                progress += 1;
            }
        }

        progress
    }

    /// Begins a walk: probe the PSCLs deepest-first and start at the deepest
    /// hit, or at CR3.
    fn handle_read(&mut self, pkt: &Request, ul: ChannelId, channels: &mut Channels, vmem: &mut VirtualMemory) -> bool {
        if self.mshr.len() >= self.mshr_size {
            return false;
        }

        let vaddr = pkt.v_address;
        let mut level = vmem.levels() - 1;
        let mut ptw_addr = self.cr3_addr | (vmem.get_offset(vaddr, level) * PTE_BYTES);
        for (idx, pscl) in self.pscl.iter_mut().enumerate() {
            if let Some(cached) = pscl.check_hit(vaddr) {
                level = idx;
                ptw_addr = cached;
                break;
            }
        }

        let entry = WalkEntry {
            address: ptw_addr,
            v_address: vaddr,
            data: 0,
            cpu: pkt.cpu,
            asid: pkt.asid,
            pf_metadata: pkt.pf_metadata,
            translation_level: level,
            instr_depend_on_me: pkt.instr_depend_on_me.clone(),
            to_return: if pkt.response_requested { vec![ul] } else { Vec::new() },
        };

        debug!(
            ptw = %self.name,
            v_address = vaddr,
            pte_address = ptw_addr,
            translation_level = level,
            "walk start"
        );

        self.step_translation(entry, channels)
    }

    /// A PTE has come back and waited out its latency: cache the partial
    /// translation and read the next level.
    fn handle_fill(&mut self, fill: &WalkEntry, channels: &mut Channels) -> bool {
        debug_assert!(fill.translation_level > 0);
        self.pscl[fill.translation_level - 1].fill(fill.v_address, fill.data);

        let mut next = fill.clone();
        next.address = fill.data;
        next.translation_level = fill.translation_level - 1;
        self.step_translation(next, channels)
    }

    /// Issues the PTE read below; the walk stalls in place when refused.
    fn step_translation(&mut self, entry: WalkEntry, channels: &mut Channels) -> bool {
        let request = Request {
            address: entry.address,
            v_address: entry.v_address,
            data: 0,
            instr_id: 0,
            ip: 0,
            pf_metadata: entry.pf_metadata,
            cpu: entry.cpu,
            asid: entry.asid,
            kind: AccessType::Translation,
            response_requested: true,
            is_translated: true,
            instr_depend_on_me: entry.instr_depend_on_me.clone(),
            forward_checked: false,
        };
        if !channels[self.lower_level].add_rq(request) {
            return false;
        }
        self.mshr.push(entry);
        true
    }

    /// Routes a lower-level response to every matching walk step.
    fn finish_packet(&mut self, packet: &Response, vmem: &mut VirtualMemory, now: u64) {
        let block = packet.address >> LOG2_BLOCK_SIZE;
        let mut idx = 0;
        while idx < self.mshr.len() {
            if self.mshr[idx].address >> LOG2_BLOCK_SIZE != block {
                idx += 1;
                continue;
            }
            let mut entry = self.mshr.remove(idx);
            let (data, mut penalty) = if entry.translation_level > 0 {
                vmem.pte_pa(entry.cpu, entry.v_address, entry.translation_level - 1)
            } else {
                vmem.va_to_pa(entry.cpu, entry.v_address)
            };
            if !self.warmup {
                penalty += self.hit_latency;
            }
            entry.data = data;

            debug!(
                ptw = %self.name,
                v_address = entry.v_address,
                data,
                translation_level = entry.translation_level,
                penalty,
                "walk step"
            );

            let waitable = Waitable {
                ready_at: now + penalty,
                entry,
            };
            if waitable.entry.translation_level > 0 {
                self.finished.push(waitable);
            } else {
                self.completed.push(waitable);
            }
        }
    }

    /// Outstanding walk count.
    pub fn mshr_occupancy(&self) -> usize {
        self.mshr.len()
    }

    /// The CPU this walker serves.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Dumps outstanding walks when the watchdog trips.
    pub fn print_deadlock(&self) {
        if self.mshr.is_empty() {
            println!("{} MSHR empty", self.name);
        } else {
            for entry in &self.mshr {
                println!(
                    "[{}_MSHR] address: {:#x} v_addr: {:#x} translation_level: {}",
                    self.name, entry.address, entry.v_address, entry.translation_level
                );
            }
        }
    }
}
