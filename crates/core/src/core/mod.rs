//! The out-of-order core model.
//!
//! Instructions flow from the trace-fed input queue through the fetch,
//! decode, dispatch, schedule, execute, and retire stages. This module
//! provides:
//! 1. **Stage deques:** IFETCH/DECODE/DISPATCH buffers and the reorder
//!    buffer, each gated by configured widths and latencies.
//! 2. **Dependencies:** Register producer tracking by instruction id, with
//!    wakeup at execution completion.
//! 3. **Memory:** Load and store queues with store-to-load forwarding over
//!    the L1D channel.
//! 4. **Control flow:** Composite branch predictor and BTB chains (last
//!    vote wins), with fetch frozen from misprediction until the penalty
//!    after the branch retires.
//! 5. **DIB:** A decoded-instruction buffer that lets recently decoded
//!    instructions skip fetch and decode latency.
//!
//! Stages run in reverse pipeline order each tick so an instruction cannot
//! advance two stages in one cycle.

pub mod bru;
pub mod instruction;

use std::collections::VecDeque;

use tracing::debug;

use crate::channel::{ChannelId, Channels, Request};
use crate::common::{LOG2_BLOCK_SIZE, LruTable, lg2};
use crate::config::CoreConfig;
use crate::operable::Operable;
use crate::stats::CoreStats;

use self::bru::{BtbChain, PredictorChain};
use self::instruction::{BranchType, COMPLETED, INFLIGHT, OooInstr};

/// Architectural register namespace size.
const NUM_REGS: usize = 256;

/// An entry in the load or store queue.
#[derive(Clone, Debug)]
struct LsqEntry {
    instr_id: u64,
    virtual_address: u64,
    ip: u64,
    /// Ready time; `u64::MAX` until the owning instruction executes.
    event_cycle: u64,
    asid: [u8; 2],
    /// For loads: the request has been issued. For stores: the data is
    /// ready and dependents have been woken.
    fetch_issued: bool,
    /// For loads: the store this load forwards from, if any.
    producer_id: Option<u64>,
    /// For stores: load-queue slots waiting on this store's data.
    lq_depend_on_me: Vec<usize>,
}

impl LsqEntry {
    fn new(instr_id: u64, virtual_address: u64, ip: u64, asid: [u8; 2]) -> Self {
        Self {
            instr_id,
            virtual_address,
            ip,
            event_cycle: u64::MAX,
            asid,
            fetch_issued: false,
            producer_id: None,
            lq_depend_on_me: Vec::new(),
        }
    }
}

/// One simulated out-of-order core.
pub struct OooCore {
    pub name: String,
    pub cpu: usize,
    pub clock: Operable,

    ifetch_buffer_size: usize,
    decode_buffer_size: usize,
    dispatch_buffer_size: usize,
    rob_size: usize,
    sq_size: usize,
    fetch_width: usize,
    decode_width: usize,
    dispatch_width: usize,
    schedule_width: usize,
    exec_width: usize,
    lq_width: usize,
    sq_width: usize,
    retire_width: usize,
    mispredict_penalty: u64,
    decode_latency: u64,
    dispatch_latency: u64,
    schedule_latency: u64,
    exec_latency: u64,
    l1i_bandwidth: usize,
    l1d_bandwidth: usize,
    in_queue_size: usize,

    l1i_bus: ChannelId,
    l1d_bus: ChannelId,

    pub input_queue: VecDeque<OooInstr>,
    ifetch_buffer: VecDeque<OooInstr>,
    decode_buffer: VecDeque<OooInstr>,
    dispatch_buffer: VecDeque<OooInstr>,
    rob: VecDeque<OooInstr>,
    lq: Vec<Option<LsqEntry>>,
    sq: VecDeque<LsqEntry>,
    reg_producers: Vec<Vec<u64>>,
    dib: LruTable<()>,

    predictors: PredictorChain,
    btb: BtbChain,
    fetch_resume_cycle: u64,
    /// Branches seen this tick, for the L1I prefetcher's branch hook.
    pub branch_events: Vec<(u64, BranchType, u64)>,

    pub num_retired: u64,
    pub warmup: bool,
    current_cycle: u64,
    pub stats: CoreStats,
}

impl OooCore {
    /// Builds a core wired to its L1I and L1D channels.
    pub fn new(config: &CoreConfig, cpu: usize, l1i_bus: ChannelId, l1d_bus: ChannelId) -> Self {
        let name = format!("cpu{}", cpu);
        Self {
            name: name.clone(),
            cpu,
            clock: Operable::new(config.clock_period),
            ifetch_buffer_size: config.ifetch_buffer_size,
            decode_buffer_size: config.decode_buffer_size,
            dispatch_buffer_size: config.dispatch_buffer_size,
            rob_size: config.rob_size,
            sq_size: config.sq_size,
            fetch_width: config.fetch_width,
            decode_width: config.decode_width,
            dispatch_width: config.dispatch_width,
            schedule_width: config.schedule_width,
            exec_width: config.exec_width,
            lq_width: config.lq_width,
            sq_width: config.sq_width,
            retire_width: config.retire_width,
            mispredict_penalty: config.mispredict_penalty,
            decode_latency: config.decode_latency,
            dispatch_latency: config.dispatch_latency,
            schedule_latency: config.schedule_latency,
            exec_latency: config.exec_latency,
            l1i_bandwidth: config.l1i_bandwidth,
            l1d_bandwidth: config.l1d_bandwidth,
            in_queue_size: 2 * config.fetch_width,
            l1i_bus,
            l1d_bus,
            input_queue: VecDeque::new(),
            ifetch_buffer: VecDeque::new(),
            decode_buffer: VecDeque::new(),
            dispatch_buffer: VecDeque::new(),
            rob: VecDeque::new(),
            lq: (0..config.lq_size).map(|_| None).collect(),
            sq: VecDeque::new(),
            reg_producers: vec![Vec::new(); NUM_REGS],
            dib: LruTable::new(config.dib_sets, config.dib_ways, lg2(config.dib_window)),
            predictors: PredictorChain::build(&config.branch_predictors),
            btb: BtbChain::build(&config.btbs),
            fetch_resume_cycle: 0,
            branch_events: Vec::new(),
            num_retired: 0,
            warmup: false,
            current_cycle: 0,
            stats: CoreStats {
                name,
                ..CoreStats::default()
            },
        }
    }

    /// Runs module initialization hooks.
    pub fn initialize(&mut self) {
        self.predictors.initialize();
        self.btb.initialize();
    }

    /// Marks a phase boundary: measured counters restart here.
    pub fn begin_phase(&mut self) {
        self.stats = CoreStats {
            name: self.name.clone(),
            begin_instrs: self.num_retired,
            begin_cycles: self.current_cycle,
            end_instrs: self.num_retired,
            end_cycles: self.current_cycle,
            ..CoreStats::default()
        };
    }

    /// Closes the measured phase.
    pub fn end_phase(&mut self) {
        self.stats.end_instrs = self.num_retired;
        self.stats.end_cycles = self.current_cycle;
    }

    /// Whether the trace frontend may push more instructions this cycle.
    pub fn input_queue_has_room(&self) -> bool {
        self.input_queue.len() < self.in_queue_size
    }

    /// Instructions retired in the current phase.
    pub fn sim_instr(&self) -> u64 {
        self.num_retired - self.stats.begin_instrs
    }

    /// Cycles elapsed in the current phase.
    pub fn sim_cycle(&self) -> u64 {
        self.current_cycle - self.stats.begin_cycles
    }

    /// Current ROB occupancy.
    pub fn rob_occupancy(&self) -> usize {
        self.rob.len()
    }

    /// Current fetch buffer occupancy.
    pub fn ifetch_occupancy(&self) -> usize {
        self.ifetch_buffer.len()
    }

    /// One clock edge: all stages, retirement first.
    pub fn operate(&mut self, channels: &mut Channels) -> u64 {
        self.current_cycle += 1;
        let mut progress = 0u64;

        progress += self.retire_rob();
        progress += self.complete_inflight_instruction();
        progress += self.handle_memory_return(channels);
        progress += self.operate_lsq(channels);
        progress += self.schedule_memory_instruction();
        progress += self.execute_instruction();
        progress += self.schedule_instruction();
        progress += self.dispatch_instruction();
        progress += self.decode_instruction();
        progress += self.promote_to_decode();
        progress += self.fetch_instruction(channels);
        progress += self.translate_fetch();
        progress += self.check_dib();
        progress += self.initialize_instruction();

        progress
    }

    fn rob_index_of(&self, instr_id: u64) -> Option<usize> {
        // The ROB is in program order, so ids are sorted.
        self.rob.binary_search_by_key(&instr_id, |x| x.instr_id).ok()
    }

    // ── Retirement ──

    /// Retires up to `RETIRE_WIDTH` completed instructions from the ROB
    /// head. Branch modules train here, and a mispredicted branch releases
    /// the fetch freeze after the penalty.
    fn retire_rob(&mut self) -> u64 {
        let mut retired = 0;
        while retired < self.retire_width {
            let Some(head) = self.rob.front() else { break };
            if head.executed != COMPLETED {
                break;
            }
            let head = self.rob.pop_front().unwrap();
            debug!(core = %self.name, instr_id = head.instr_id, ip = head.ip, cycle = self.current_cycle, "retire");

            if head.branch.is_branch() {
                self.predictors
                    .last_branch_result(head.ip, head.branch_target, head.branch_taken, head.branch);
                self.btb.update_btb(head.ip, head.branch_target, head.branch_taken, head.branch);
                if head.branch_mispredicted {
                    self.fetch_resume_cycle = self.current_cycle + self.mispredict_penalty;
                }
            }

            self.num_retired += 1;
            retired += 1;
        }
        retired as u64
    }

    // ── Completion ──

    /// Finalizes executed instructions whose latency and memory operations
    /// are done: destination producers are freed and register dependents
    /// woken.
    fn complete_inflight_instruction(&mut self) -> u64 {
        let mut bw = self.exec_width;
        let mut completed = 0;
        for idx in 0..self.rob.len() {
            if bw == 0 {
                break;
            }
            let instr = &self.rob[idx];
            if instr.executed != INFLIGHT
                || instr.event_cycle > self.current_cycle
                || instr.completed_mem_ops != instr.num_mem_ops()
            {
                continue;
            }

            let instr_id = self.rob[idx].instr_id;
            let dest_regs = self.rob[idx].destination_registers.clone();
            let dependents = std::mem::take(&mut self.rob[idx].reg_dependents);
            self.rob[idx].executed = COMPLETED;

            for reg in dest_regs {
                self.reg_producers[reg as usize].retain(|&id| id != instr_id);
            }
            for dep in dependents {
                if let Some(dep_idx) = self.rob_index_of(dep) {
                    self.rob[dep_idx].num_reg_dependent -= 1;
                }
            }

            bw -= 1;
            completed += 1;
        }
        completed
    }

    // ── Memory returns ──

    /// Consumes L1I and L1D responses: fetch groups complete contiguous
    /// IFETCH_BUFFER entries, data responses finish matching loads.
    fn handle_memory_return(&mut self, channels: &mut Channels) -> u64 {
        let mut progress = 0;

        let mut l1i_bw = self.fetch_width;
        let mut to_read = self.l1i_bandwidth;
        while to_read > 0 {
            let Some(front) = channels[self.l1i_bus].returned.front_mut() else { break };
            while l1i_bw > 0 && !front.instr_depend_on_me.is_empty() {
                let dep = front.instr_depend_on_me.remove(0);
                if let Some(instr) = self.ifetch_buffer.iter_mut().find(|x| x.instr_id == dep) {
                    if instr.ip >> LOG2_BLOCK_SIZE == front.v_address >> LOG2_BLOCK_SIZE && instr.fetched != 0 {
                        instr.fetched = COMPLETED;
                        l1i_bw -= 1;
                        progress += 1;
                    }
                }
            }
            if front.instr_depend_on_me.is_empty() {
                channels[self.l1i_bus].returned.pop_front();
                to_read -= 1;
            } else {
                break;
            }
        }

        let mut l1d_bw = self.l1d_bandwidth;
        while l1d_bw > 0 {
            let Some(response) = channels[self.l1d_bus].returned.pop_front() else { break };
            for slot in 0..self.lq.len() {
                let finished = match &self.lq[slot] {
                    Some(entry) => {
                        entry.fetch_issued
                            && entry.virtual_address >> LOG2_BLOCK_SIZE == response.v_address >> LOG2_BLOCK_SIZE
                    }
                    None => false,
                };
                if finished {
                    let entry = self.lq[slot].take().unwrap();
                    self.finish_mem_op(entry.instr_id);
                    progress += 1;
                }
            }
            l1d_bw -= 1;
        }

        progress
    }

    fn finish_mem_op(&mut self, instr_id: u64) {
        if let Some(idx) = self.rob_index_of(instr_id) {
            self.rob[idx].completed_mem_ops += 1;
            debug_assert!(self.rob[idx].completed_mem_ops <= self.rob[idx].num_mem_ops());
        }
    }

    // ── Load/store issue ──

    /// Wakes finished stores' dependents, drains retired stores to the L1D,
    /// and issues ready loads.
    fn operate_lsq(&mut self, channels: &mut Channels) -> u64 {
        let mut progress = 0;
        let mut store_bw = self.sq_width;

        // Finish executed stores: value ready, forward to dependent loads.
        let mut idx = 0;
        while store_bw > 0 && idx < self.sq.len() {
            if !self.sq[idx].fetch_issued && self.sq[idx].event_cycle <= self.current_cycle {
                let store_id = self.sq[idx].instr_id;
                let dependents = std::mem::take(&mut self.sq[idx].lq_depend_on_me);
                self.sq[idx].fetch_issued = true;
                self.sq[idx].event_cycle = self.current_cycle;

                self.finish_mem_op(store_id);
                for slot in dependents {
                    if let Some(load) = self.lq[slot].take() {
                        self.finish_mem_op(load.instr_id);
                    }
                }
                store_bw -= 1;
                progress += 1;
            }
            idx += 1;
        }

        // Complete stores that have left the ROB: the write goes to the L1D.
        let complete_id = self.rob.front().map_or(u64::MAX, |x| x.instr_id);
        while store_bw > 0 {
            let Some(front) = self.sq.front() else { break };
            if !(front.fetch_issued && front.instr_id < complete_id && front.event_cycle <= self.current_cycle) {
                break;
            }
            let request = Request {
                address: front.virtual_address,
                v_address: front.virtual_address,
                instr_id: front.instr_id,
                ip: front.ip,
                cpu: self.cpu,
                asid: front.asid,
                kind: crate::common::AccessType::Write,
                response_requested: false,
                is_translated: false,
                ..Request::default()
            };
            if !channels[self.l1d_bus].add_wq(request) {
                break;
            }
            self.sq.pop_front();
            store_bw -= 1;
            progress += 1;
        }

        // Issue ready loads.
        let mut load_bw = self.lq_width;
        for slot in 0..self.lq.len() {
            if load_bw == 0 {
                break;
            }
            let ready = match &self.lq[slot] {
                Some(entry) => {
                    entry.producer_id.is_none() && !entry.fetch_issued && entry.event_cycle < self.current_cycle
                }
                None => false,
            };
            if !ready {
                continue;
            }
            let entry = self.lq[slot].as_ref().unwrap();
            let request = Request {
                address: entry.virtual_address,
                v_address: entry.virtual_address,
                instr_id: entry.instr_id,
                ip: entry.ip,
                cpu: self.cpu,
                asid: entry.asid,
                kind: crate::common::AccessType::Load,
                is_translated: false,
                instr_depend_on_me: vec![entry.instr_id],
                ..Request::default()
            };
            if channels[self.l1d_bus].add_rq(request) {
                self.lq[slot].as_mut().unwrap().fetch_issued = true;
                load_bw -= 1;
                progress += 1;
            }
        }

        progress
    }

    // ── Memory scheduling ──

    /// Binds scheduled instructions' memory operations to LSQ slots, with
    /// store-to-load forwarding resolved at bind time.
    fn schedule_memory_instruction(&mut self) -> u64 {
        let mut bound = 0;
        let mut search_bw = self.schedule_width;
        for idx in 0..self.rob.len() {
            if search_bw == 0 {
                break;
            }
            search_bw -= 1;
            if self.rob[idx].scheduled != COMPLETED || self.rob[idx].lsq_bound || self.rob[idx].num_mem_ops() == 0 {
                continue;
            }

            let instr_id = self.rob[idx].instr_id;
            let ip = self.rob[idx].ip;
            let sources = self.rob[idx].source_memory.clone();
            let dests = self.rob[idx].destination_memory.clone();

            for smem in sources {
                let slot = self
                    .lq
                    .iter()
                    .position(|x| x.is_none())
                    .expect("dispatch guaranteed a free load queue slot");
                let mut entry = LsqEntry::new(instr_id, smem, ip, [u8::MAX, u8::MAX]);

                // Forward from the youngest prior store to the same address.
                let producer = self
                    .sq
                    .iter()
                    .enumerate()
                    .filter(|(_, sq)| sq.virtual_address == smem && sq.instr_id < instr_id)
                    .max_by_key(|(_, sq)| sq.instr_id)
                    .map(|(pos, sq)| (pos, sq.fetch_issued, sq.instr_id));
                match producer {
                    Some((_, true, _)) => {
                        // The store has finished; the load completes locally.
                        self.finish_mem_op(instr_id);
                        continue;
                    }
                    Some((pos, false, producer_id)) => {
                        entry.producer_id = Some(producer_id);
                        self.sq[pos].lq_depend_on_me.push(slot);
                    }
                    _ => {}
                }
                self.lq[slot] = Some(entry);
            }

            for dmem in dests {
                self.sq.push_back(LsqEntry::new(instr_id, dmem, ip, [u8::MAX, u8::MAX]));
            }

            self.rob[idx].lsq_bound = true;
            bound += 1;
        }
        bound
    }

    // ── Execution ──

    /// Starts execution of scheduled, dependency-free instructions.
    fn execute_instruction(&mut self) -> u64 {
        let exec_lat = if self.warmup { 0 } else { self.exec_latency };
        let mut bw = self.exec_width;
        let mut started = 0;
        for idx in 0..self.rob.len() {
            if bw == 0 {
                break;
            }
            let instr = &self.rob[idx];
            if instr.scheduled != COMPLETED
                || instr.executed != 0
                || instr.num_reg_dependent != 0
                || instr.event_cycle > self.current_cycle
            {
                continue;
            }

            let instr_id = self.rob[idx].instr_id;
            self.rob[idx].executed = INFLIGHT;
            self.rob[idx].event_cycle = self.current_cycle + exec_lat;

            // The address generation completes with execution; memory
            // operations become issueable.
            for slot in self.lq.iter_mut().flatten() {
                if slot.instr_id == instr_id {
                    slot.event_cycle = self.current_cycle + exec_lat;
                }
            }
            for entry in self.sq.iter_mut() {
                if entry.instr_id == instr_id {
                    entry.event_cycle = self.current_cycle + exec_lat;
                }
            }

            bw -= 1;
            started += 1;
        }
        started
    }

    // ── Register scheduling ──

    /// Renames: links each source register to its youngest in-flight
    /// producer and registers this instruction as producer of its
    /// destinations.
    fn schedule_instruction(&mut self) -> u64 {
        let schedule_lat = if self.warmup { 0 } else { self.schedule_latency };
        let mut search_bw = self.schedule_width;
        let mut scheduled = 0;
        for idx in 0..self.rob.len() {
            if search_bw == 0 {
                break;
            }
            search_bw -= 1;
            if self.rob[idx].scheduled != 0 {
                continue;
            }

            let instr_id = self.rob[idx].instr_id;
            let src_regs = self.rob[idx].source_registers.clone();
            let dest_regs = self.rob[idx].destination_registers.clone();

            let mut new_deps = 0;
            for reg in src_regs {
                let Some(&producer_id) = self.reg_producers[reg as usize].last() else { continue };
                if let Some(prod_idx) = self.rob_index_of(producer_id) {
                    let producer = &mut self.rob[prod_idx];
                    if producer.reg_dependents.last() != Some(&instr_id) {
                        producer.reg_dependents.push(instr_id);
                        new_deps += 1;
                    }
                }
            }

            for reg in dest_regs {
                self.reg_producers[reg as usize].push(instr_id);
            }

            let instr = &mut self.rob[idx];
            instr.num_reg_dependent += new_deps;
            instr.scheduled = COMPLETED;
            instr.event_cycle = self.current_cycle + schedule_lat;
            scheduled += 1;
        }
        scheduled
    }

    // ── Dispatch ──

    /// Moves instructions from the dispatch buffer into the ROB when the
    /// ROB and the load/store queues have room.
    fn dispatch_instruction(&mut self) -> u64 {
        // Track queue space as it is claimed; LSQ slots bind later.
        let mut lq_free = self.lq.iter().filter(|x| x.is_none()).count();
        let bound_stores: usize = self
            .rob
            .iter()
            .filter(|x| !x.lsq_bound)
            .map(|x| x.destination_memory.len())
            .sum();
        let mut sq_used = self.sq.len() + bound_stores;
        let bound_loads: usize = self
            .rob
            .iter()
            .filter(|x| !x.lsq_bound)
            .map(|x| x.source_memory.len())
            .sum();
        lq_free = lq_free.saturating_sub(bound_loads);

        let mut bw = self.dispatch_width;
        let mut dispatched = 0;
        while bw > 0 {
            let Some(front) = self.dispatch_buffer.front() else { break };
            if front.event_cycle >= self.current_cycle || self.rob.len() == self.rob_size {
                break;
            }
            if lq_free < front.source_memory.len() || sq_used + front.destination_memory.len() > self.sq_size {
                break;
            }
            lq_free -= front.source_memory.len();
            sq_used += front.destination_memory.len();
            let instr = self.dispatch_buffer.pop_front().unwrap();
            self.rob.push_back(instr);
            bw -= 1;
            dispatched += 1;
        }
        dispatched
    }

    // ── Decode ──

    /// Moves decoded instructions to the dispatch buffer, updating the DIB.
    /// Branches whose target was wrong but direction right are repaired
    /// here.
    fn decode_instruction(&mut self) -> u64 {
        let dispatch_lat = if self.warmup { 0 } else { self.dispatch_latency };
        let mut bw = self.decode_width;
        let mut decoded = 0;
        while bw > 0 && self.dispatch_buffer.len() < self.dispatch_buffer_size {
            let Some(front) = self.decode_buffer.front() else { break };
            if front.event_cycle >= self.current_cycle {
                break;
            }
            let mut instr = self.decode_buffer.pop_front().unwrap();
            self.dib.fill(instr.ip, ());

            // Direct targets resolve at decode; only the direction needed
            // the full pipeline.
            if instr.branch_mispredicted
                && matches!(
                    instr.branch,
                    BranchType::DirectJump | BranchType::DirectCall
                )
            {
                instr.branch_mispredicted = false;
                self.fetch_resume_cycle = self.current_cycle + self.mispredict_penalty;
            }

            instr.event_cycle = self.current_cycle + dispatch_lat;
            self.dispatch_buffer.push_back(instr);
            bw -= 1;
            decoded += 1;
        }
        decoded
    }

    // ── Fetch promotion ──

    /// Moves fetched instructions into the decode buffer; DIB hits skip the
    /// decode latency.
    fn promote_to_decode(&mut self) -> u64 {
        let decode_lat = if self.warmup { 0 } else { self.decode_latency };
        let mut bw = self.fetch_width;
        let mut promoted = 0;
        while bw > 0 && self.decode_buffer.len() < self.decode_buffer_size {
            let Some(front) = self.ifetch_buffer.front() else { break };
            if front.fetched != COMPLETED || front.event_cycle > self.current_cycle {
                break;
            }
            let mut instr = self.ifetch_buffer.pop_front().unwrap();
            instr.event_cycle = self.current_cycle + if instr.decoded != 0 { 0 } else { decode_lat };
            self.decode_buffer.push_back(instr);
            bw -= 1;
            promoted += 1;
        }
        promoted
    }

    // ── Fetch issue ──

    /// Issues one L1I read per contiguous group of fetch-ready instructions
    /// in the same cache block. Requests carry the virtual ip; the L1I
    /// translates.
    fn fetch_instruction(&mut self, channels: &mut Channels) -> u64 {
        let mut bw = self.l1i_bandwidth;
        let mut issued = 0;
        let mut idx = 0;
        while bw > 0 && idx < self.ifetch_buffer.len() {
            if !(self.ifetch_buffer[idx].fetch_ready && self.ifetch_buffer[idx].fetched == 0) {
                idx += 1;
                continue;
            }

            let block = self.ifetch_buffer[idx].ip >> LOG2_BLOCK_SIZE;
            let mut end = idx + 1;
            while end < self.ifetch_buffer.len()
                && self.ifetch_buffer[end].ip >> LOG2_BLOCK_SIZE == block
                && self.ifetch_buffer[end].fetch_ready
                && self.ifetch_buffer[end].fetched == 0
            {
                end += 1;
            }

            let group: Vec<u64> = self.ifetch_buffer.range(idx..end).map(|x| x.instr_id).collect();
            let ip = self.ifetch_buffer[idx].ip;
            let request = Request {
                address: ip,
                v_address: ip,
                instr_id: group[0],
                ip,
                cpu: self.cpu,
                kind: crate::common::AccessType::Load,
                is_translated: false,
                instr_depend_on_me: group,
                ..Request::default()
            };
            if !channels[self.l1i_bus].add_rq(request) {
                break;
            }
            for instr in self.ifetch_buffer.range_mut(idx..end) {
                instr.fetched = INFLIGHT;
                instr.fetch_issued = true;
            }
            bw -= 1;
            issued += 1;
            idx = end;
        }
        issued
    }

    // ── Fetch address generation ──

    /// Marks DIB-checked instructions ready for the L1I, a fetch-width at a
    /// time. Translation itself happens inside the virtually-accessed L1I.
    fn translate_fetch(&mut self) -> u64 {
        let mut bw = self.fetch_width;
        let mut marked = 0;
        for instr in self.ifetch_buffer.iter_mut() {
            if bw == 0 {
                break;
            }
            if instr.dib_checked == COMPLETED && !instr.fetch_ready && instr.fetched == 0 {
                instr.fetch_ready = true;
                bw -= 1;
                marked += 1;
            }
        }
        marked
    }

    // ── DIB lookup ──

    /// Checks recently decoded windows: a hit bypasses fetch and decode.
    fn check_dib(&mut self) -> u64 {
        let mut bw = self.fetch_width;
        let mut checked = 0;
        for instr in self.ifetch_buffer.iter_mut() {
            if bw == 0 {
                break;
            }
            if instr.dib_checked != 0 {
                continue;
            }
            if self.dib.check_hit(instr.ip).is_some() {
                instr.fetched = COMPLETED;
                instr.decoded = COMPLETED;
                instr.event_cycle = self.current_cycle;
            }
            instr.dib_checked = COMPLETED;
            bw -= 1;
            checked += 1;
        }
        checked
    }

    // ── Instruction intake ──

    /// Pulls instructions from the input queue while fetch is not frozen,
    /// predicting branches as they enter.
    fn initialize_instruction(&mut self) -> u64 {
        let room = self.ifetch_buffer_size - self.ifetch_buffer.len();
        let mut to_read = self.fetch_width.min(room);
        let mut initialized = 0;

        while self.current_cycle >= self.fetch_resume_cycle && to_read > 0 && !self.input_queue.is_empty() {
            to_read -= 1;
            let mut instr = self.input_queue.pop_front().unwrap();
            let stop_fetch = self.do_predict_branch(&mut instr);
            instr.event_cycle = self.current_cycle;
            self.ifetch_buffer.push_back(instr);
            initialized += 1;
            if stop_fetch {
                break;
            }
        }
        initialized
    }

    /// Consults the predictor and BTB chains and compares against the trace
    /// truth. Returns true when fetch must stop after this instruction.
    fn do_predict_branch(&mut self, instr: &mut OooInstr) -> bool {
        if !instr.branch.is_branch() {
            return false;
        }

        self.stats.total_branch_types[instr.branch as usize] += 1;
        self.branch_events.push((instr.ip, instr.branch, instr.branch_target));
        let (mut predicted_target, _btb_hit) = self.btb.btb_prediction(instr.ip);
        let direction = self.predictors.predict_branch(instr.ip);
        // Unconditional branches only ever go one way.
        instr.branch_prediction = direction || instr.branch != BranchType::Conditional;
        if !instr.branch_prediction {
            predicted_target = 0;
        }

        let wrong_target = predicted_target != instr.branch_target;
        let wrong_direction = instr.branch == BranchType::Conditional && instr.branch_taken != instr.branch_prediction;
        if wrong_target || wrong_direction {
            self.stats.branch_type_misses[instr.branch as usize] += 1;
            self.stats.total_rob_occupancy_at_branch_mispredict += self.rob.len() as u64;
            if !self.warmup {
                instr.branch_mispredicted = true;
                // Frozen until the branch resolves; retirement (or decode,
                // for direct targets) sets the resume cycle.
                self.fetch_resume_cycle = u64::MAX;
                return true;
            }
            return false;
        }

        // A correctly predicted taken branch still ends this fetch group.
        instr.branch_taken
    }

    /// Dumps pipeline state when the watchdog trips.
    pub fn print_deadlock(&self) {
        if let Some(head) = self.rob.front() {
            println!(
                "[{}_ROB] head instr_id: {} ip: {:#x} scheduled: {} executed: {} num_reg_dependent: {} mem_ops: {}/{} event_cycle: {}",
                self.name,
                head.instr_id,
                head.ip,
                head.scheduled,
                head.executed,
                head.num_reg_dependent,
                head.completed_mem_ops,
                head.num_mem_ops(),
                head.event_cycle
            );
        } else {
            println!("{} ROB empty", self.name);
        }
        println!(
            "[{}] IFETCH: {} DECODE: {} DISPATCH: {} ROB: {} LQ: {} SQ: {} fetch_resume: {}",
            self.name,
            self.ifetch_buffer.len(),
            self.decode_buffer.len(),
            self.dispatch_buffer.len(),
            self.rob.len(),
            self.lq.iter().filter(|x| x.is_some()).count(),
            self.sq.len(),
            self.fetch_resume_cycle
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channels;
    use crate::config::CoreConfig;

    fn test_core(channels: &mut Channels) -> OooCore {
        let l1i = channels.create(32, 32, 32, LOG2_BLOCK_SIZE, false);
        let l1d = channels.create(32, 32, 32, LOG2_BLOCK_SIZE, false);
        OooCore::new(&CoreConfig::default(), 0, l1i, l1d)
    }

    fn simple_instr(id: u64, ip: u64) -> OooInstr {
        OooInstr::new(id, ip, false, false, vec![1], vec![], vec![], vec![])
    }

    #[test]
    fn test_empty_rob_retires_nothing() {
        let mut channels = Channels::new();
        let mut core = test_core(&mut channels);
        core.operate(&mut channels);
        assert_eq!(core.num_retired, 0);
    }

    #[test]
    fn test_uncompleted_head_blocks_retirement() {
        let mut channels = Channels::new();
        let mut core = test_core(&mut channels);
        let mut first = simple_instr(0, 0x1000);
        first.executed = 0;
        let mut second = simple_instr(1, 0x1004);
        second.executed = COMPLETED;
        core.rob.push_back(first);
        core.rob.push_back(second);

        core.operate(&mut channels);
        assert_eq!(core.num_retired, 0);
        assert_eq!(core.rob.len(), 2);
    }

    #[test]
    fn test_retirement_is_bandwidth_limited() {
        let mut channels = Channels::new();
        let mut core = test_core(&mut channels);
        let count = 2 * core.retire_width;
        for i in 0..count {
            let mut instr = simple_instr(i as u64, 0x1000 + 4 * i as u64);
            instr.executed = COMPLETED;
            core.rob.push_back(instr);
        }

        core.operate(&mut channels);
        assert_eq!(core.num_retired as usize, core.retire_width);

        core.operate(&mut channels);
        assert_eq!(core.num_retired as usize, count);
        assert!(core.rob.is_empty());
    }

    #[test]
    fn test_register_dependency_blocks_execution() {
        let mut channels = Channels::new();
        let mut core = test_core(&mut channels);
        // Producer writes r1, consumer reads r1.
        let producer = OooInstr::new(0, 0x1000, false, false, vec![1], vec![], vec![], vec![]);
        let consumer = OooInstr::new(1, 0x1004, false, false, vec![2], vec![1], vec![], vec![]);
        core.rob.push_back(producer);
        core.rob.push_back(consumer);

        // Rename both; the consumer picks up one dependency.
        core.schedule_instruction();
        assert_eq!(core.rob[1].num_reg_dependent, 1);

        // Producer executes and completes; the dependent is woken.
        core.current_cycle += 1;
        core.execute_instruction();
        assert_eq!(core.rob[0].executed, INFLIGHT);
        assert_eq!(core.rob[1].executed, 0);
        core.current_cycle += 1;
        core.complete_inflight_instruction();
        assert_eq!(core.rob[0].executed, COMPLETED);
        assert_eq!(core.rob[1].num_reg_dependent, 0);

        core.execute_instruction();
        assert_eq!(core.rob[1].executed, INFLIGHT);
    }

    #[test]
    fn test_store_to_load_forwarding_no_l1d_traffic() {
        let mut channels = Channels::new();
        let mut core = test_core(&mut channels);
        let addr = 0xdead_b000u64;
        // A store then a dependent load to the same address.
        let store = OooInstr::new(0, 0x1000, false, false, vec![], vec![], vec![addr], vec![]);
        let load = OooInstr::new(1, 0x1004, false, false, vec![3], vec![], vec![], vec![addr]);
        core.rob.push_back(store);
        core.rob.push_back(load);

        core.schedule_instruction();
        core.schedule_memory_instruction();
        assert_eq!(core.sq.len(), 1);
        assert_eq!(core.sq[0].lq_depend_on_me.len(), 1);

        // Execute both; the store finishes first and forwards.
        core.current_cycle += 1;
        core.execute_instruction();
        core.current_cycle += 1;
        core.operate_lsq(&mut channels);

        // The load finished without an L1D read.
        assert_eq!(channels[core.l1d_bus].rq.len(), 0);
        let load_idx = core.rob_index_of(1).unwrap();
        assert_eq!(core.rob[load_idx].completed_mem_ops, 1);
    }
}
