//! Off-chip memory controller and DRAM channel model.
//!
//! The controller demultiplexes last-level-cache traffic onto DRAM channels
//! by address hash; each channel owns bounded read/write queues and a bank
//! state machine. This module provides:
//! 1. **Scheduling:** Oldest-ready-first selection over the active queue,
//!    preferring requests whose bank is free.
//! 2. **Row buffers:** Open-row tracking with hit/miss/conflict timing.
//! 3. **Write mode:** Watermark-driven read/write turnaround with bus
//!    turnaround penalties.
//! 4. **Refresh:** Periodic 8-row refresh bursts that steal bank time.
//! 5. **Data bus:** Single-owner bus arbitration with congestion accounting.

use tracing::debug;

use crate::channel::{ChannelId, Channels, Request, Response, merge_program_order};
use crate::common::{BLOCK_SIZE, LOG2_BLOCK_SIZE, bitmask, lg2};
use crate::config::DramConfig;
use crate::operable::Operable;
use crate::stats::DramChannelStats;

/// Converts a time in nanoseconds to channel cycles, rounding up.
fn cycles(time_ns: f64, io_freq_mhz: u64) -> u64 {
    (time_ns / 1000.0 * io_freq_mhz as f64).ceil() as u64
}

/// Which queue a bank request came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueKind {
    Read,
    Write,
}

/// A request slot in a DRAM channel queue.
#[derive(Clone, Debug)]
struct DramRequest {
    address: u64,
    v_address: u64,
    data: u64,
    pf_metadata: u32,
    instr_depend_on_me: Vec<u64>,
    to_return: Vec<ChannelId>,
    forward_checked: bool,
    scheduled: bool,
    event_cycle: u64,
}

impl DramRequest {
    fn new(req: &Request, now: u64, to_return: Vec<ChannelId>) -> Self {
        Self {
            address: req.address,
            v_address: req.v_address,
            data: req.data,
            pf_metadata: req.pf_metadata,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            to_return,
            forward_checked: false,
            scheduled: false,
            event_cycle: now,
        }
    }

    fn response(&self) -> Response {
        Response {
            address: self.address,
            v_address: self.v_address,
            data: self.data,
            pf_metadata: self.pf_metadata,
            instr_depend_on_me: self.instr_depend_on_me.clone(),
        }
    }
}

/// Per-bank scheduler state, one per rank x bank.
#[derive(Clone, Debug, Default)]
struct BankRequest {
    valid: bool,
    row_buffer_hit: bool,
    need_refresh: bool,
    under_refresh: bool,
    open_row: Option<u64>,
    event_cycle: u64,
    /// The queue slot this bank is servicing.
    slot: Option<(QueueKind, usize)>,
}

/// One DRAM channel: queues, banks, and the data bus.
pub struct DramChannel {
    rq: Vec<Option<DramRequest>>,
    wq: Vec<Option<DramRequest>>,
    bank_request: Vec<BankRequest>,
    /// Index into `bank_request` of the request owning the data bus.
    active_request: Option<usize>,
    dbus_cycle_available: u64,
    write_mode: bool,
    refresh_row: u64,

    t_rp: u64,
    t_rcd: u64,
    t_cas: u64,
    dbus_turn_around_time: u64,
    dbus_return_time: u64,
    refresh_interval: u64,
    write_high_wm: usize,
    write_low_wm: usize,

    rows: usize,
    columns: usize,
    ranks: usize,
    banks: usize,
    channel_bits: u32,

    current_cycle: u64,
    pub warmup: bool,
    pub stats: DramChannelStats,
}

impl DramChannel {
    fn new(config: &DramConfig, index: usize) -> Self {
        let refresh_bursts_per_64ms = config.rows as f64 / 8.0;
        Self {
            rq: vec![None; config.rq_size],
            wq: vec![None; config.wq_size],
            bank_request: vec![BankRequest::default(); config.ranks * config.banks],
            active_request: None,
            dbus_cycle_available: 0,
            write_mode: false,
            refresh_row: 0,
            t_rp: cycles(config.t_rp_ns, config.io_freq),
            t_rcd: cycles(config.t_rcd_ns, config.io_freq),
            t_cas: cycles(config.t_cas_ns, config.io_freq),
            dbus_turn_around_time: cycles(config.turnaround_ns, config.io_freq),
            dbus_return_time: (BLOCK_SIZE as f64 / config.channel_width as f64).ceil() as u64,
            refresh_interval: ((config.io_freq as f64 * 1e6 * 0.064) / refresh_bursts_per_64ms) as u64,
            write_high_wm: config.write_high_wm,
            write_low_wm: config.write_low_wm,
            rows: config.rows,
            columns: config.columns,
            ranks: config.ranks,
            banks: config.banks,
            channel_bits: lg2(config.channels as u64),
            current_cycle: 0,
            warmup: false,
            stats: DramChannelStats {
                name: format!("Channel {}", index),
                ..DramChannelStats::default()
            },
        }
    }

    /// DRAM timing, exposed for tests and derived latencies.
    pub fn timing(&self) -> (u64, u64, u64) {
        (self.t_rp, self.t_rcd, self.t_cas)
    }

    fn queue(&self, kind: QueueKind) -> &Vec<Option<DramRequest>> {
        match kind {
            QueueKind::Read => &self.rq,
            QueueKind::Write => &self.wq,
        }
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut Vec<Option<DramRequest>> {
        match kind {
            QueueKind::Read => &mut self.rq,
            QueueKind::Write => &mut self.wq,
        }
    }

    /// Address decomposition, low to high:
    /// `block offset | channel | bank | column | rank | row`.
    pub fn get_bank(&self, address: u64) -> u64 {
        let shift = self.channel_bits + LOG2_BLOCK_SIZE;
        (address >> shift) & bitmask(lg2(self.banks as u64))
    }

    pub fn get_column(&self, address: u64) -> u64 {
        let shift = lg2(self.banks as u64) + self.channel_bits + LOG2_BLOCK_SIZE;
        (address >> shift) & bitmask(lg2(self.columns as u64))
    }

    pub fn get_rank(&self, address: u64) -> u64 {
        let shift = lg2(self.banks as u64) + lg2(self.columns as u64) + self.channel_bits + LOG2_BLOCK_SIZE;
        (address >> shift) & bitmask(lg2(self.ranks as u64))
    }

    pub fn get_row(&self, address: u64) -> u64 {
        let shift = lg2(self.ranks as u64)
            + lg2(self.banks as u64)
            + lg2(self.columns as u64)
            + self.channel_bits
            + LOG2_BLOCK_SIZE;
        (address >> shift) & bitmask(lg2(self.rows as u64))
    }

    fn bank_index(&self, address: u64) -> usize {
        (self.get_rank(address) as usize) * self.banks + self.get_bank(address) as usize
    }

    /// One clock edge.
    pub fn operate(&mut self, channels: &mut Channels) -> u64 {
        self.current_cycle += 1;
        let mut progress = 0u64;

        if self.warmup {
            // Warm-up fast path: answer reads immediately, drop writes.
            for slot in &mut self.rq {
                if let Some(entry) = slot.take() {
                    channels.push_response(&entry.to_return, &entry.response());
                    progress += 1;
                }
            }
            for slot in &mut self.wq {
                if slot.take().is_some() {
                    progress += 1;
                }
            }
        }

        self.check_write_collision();
        self.check_read_collision(channels);
        progress += self.finish_dbus_request(channels);
        self.swap_write_mode();
        progress += self.schedule_refresh();
        progress += self.populate_dbus();
        let selected = self.schedule_packet();
        progress += self.service_packet(selected);

        progress
    }

    /// Releases the data bus when the active request's transfer completes.
    fn finish_dbus_request(&mut self, channels: &mut Channels) -> u64 {
        let Some(bank_idx) = self.active_request else { return 0 };
        if self.bank_request[bank_idx].event_cycle > self.current_cycle {
            return 0;
        }

        let (kind, slot_idx) = self.bank_request[bank_idx].slot.expect("active bank without a slot");
        let entry = self.queue_mut(kind)[slot_idx].take().expect("active bank aliases a reset slot");
        channels.push_response(&entry.to_return, &entry.response());

        self.bank_request[bank_idx].valid = false;
        self.bank_request[bank_idx].slot = None;
        self.active_request = None;
        1
    }

    /// Marks refresh-due rows and walks each bank's refresh state.
    fn schedule_refresh(&mut self) -> u64 {
        let mut progress = 0;
        let refresh_due = self.current_cycle % self.refresh_interval == 1;

        if refresh_due {
            self.refresh_row += 8;
            self.stats.refresh_cycles += 1;
            if self.refresh_row >= self.rows as u64 {
                self.refresh_row = 0;
            }
        }

        for bank in &mut self.bank_request {
            if refresh_due {
                bank.need_refresh = true;
            }
            if bank.need_refresh && !bank.valid {
                bank.event_cycle = self.current_cycle + self.t_cas + self.t_rcd;
                bank.need_refresh = false;
                bank.under_refresh = true;
            } else if bank.under_refresh && bank.event_cycle <= self.current_cycle {
                bank.under_refresh = false;
                bank.open_row = None;
                progress += 1;
            }
        }
        progress
    }

    /// Toggles between read and write service when the queues demand it.
    fn swap_write_mode(&mut self) {
        let wq_occu = self.wq.iter().filter(|x| x.is_some()).count();
        let rq_occu = self.rq.iter().filter(|x| x.is_some()).count();

        let enter_write = !self.write_mode && (wq_occu >= self.write_high_wm || (rq_occu == 0 && wq_occu > 0));
        let leave_write = self.write_mode && (wq_occu == 0 || (rq_occu > 0 && wq_occu < self.write_low_wm));
        if !enter_write && !leave_write {
            return;
        }

        // Unschedule every bank except the one on the data bus.
        for idx in 0..self.bank_request.len() {
            if Some(idx) == self.active_request || !self.bank_request[idx].valid {
                continue;
            }
            // A row that had not begun its column access is released.
            if self.bank_request[idx].event_cycle < self.current_cycle + self.t_cas {
                self.bank_request[idx].open_row = None;
            }
            self.bank_request[idx].valid = false;
            if let Some((kind, slot_idx)) = self.bank_request[idx].slot.take() {
                let now = self.current_cycle;
                if let Some(pkt) = self.queue_mut(kind)[slot_idx].as_mut() {
                    pkt.scheduled = false;
                    pkt.event_cycle = now;
                }
            }
        }

        self.dbus_cycle_available = match self.active_request {
            Some(bank_idx) => self.bank_request[bank_idx].event_cycle + self.dbus_turn_around_time,
            None => self.current_cycle + self.dbus_turn_around_time,
        };

        self.write_mode = !self.write_mode;
        debug!(channel = %self.stats.name, write_mode = self.write_mode, cycle = self.current_cycle, "mode swap");
    }

    /// Puts the most urgent ready bank request on the data bus.
    fn populate_dbus(&mut self) -> u64 {
        let next = self
            .bank_request
            .iter()
            .enumerate()
            .filter(|(_, bank)| bank.valid)
            .min_by_key(|(_, bank)| bank.event_cycle)
            .map(|(idx, _)| idx);
        let Some(bank_idx) = next else { return 0 };
        if self.bank_request[bank_idx].event_cycle > self.current_cycle {
            return 0;
        }

        if self.active_request.is_none() && self.dbus_cycle_available <= self.current_cycle {
            self.active_request = Some(bank_idx);
            self.bank_request[bank_idx].event_cycle = self.current_cycle + self.dbus_return_time;

            match (self.bank_request[bank_idx].row_buffer_hit, self.write_mode) {
                (true, true) => self.stats.wq_row_buffer_hit += 1,
                (true, false) => self.stats.rq_row_buffer_hit += 1,
                (false, true) => self.stats.wq_row_buffer_miss += 1,
                (false, false) => self.stats.rq_row_buffer_miss += 1,
            }
            1
        } else {
            // Bus congestion: account the wait.
            let free_at = match self.active_request {
                Some(active) => self.bank_request[active].event_cycle,
                None => self.dbus_cycle_available,
            };
            self.stats.dbus_cycle_congested += free_at.saturating_sub(self.current_cycle);
            self.stats.dbus_count_congested += 1;
            0
        }
    }

    /// Chooses the oldest unscheduled entry in the active queue, preferring
    /// entries whose bank is free and not refreshing.
    fn schedule_packet(&self) -> Option<(QueueKind, usize)> {
        let kind = if self.write_mode { QueueKind::Write } else { QueueKind::Read };
        let queue = self.queue(kind);

        let mut best: Option<(bool, u64, usize)> = None;
        for (idx, slot) in queue.iter().enumerate() {
            let Some(pkt) = slot else { continue };
            if pkt.scheduled {
                continue;
            }
            let bank = &self.bank_request[self.bank_index(pkt.address)];
            let ready = !bank.valid && !bank.under_refresh;
            let better = match best {
                None => true,
                Some((best_ready, best_cycle, _)) => {
                    if ready != best_ready {
                        ready
                    } else {
                        pkt.event_cycle < best_cycle
                    }
                }
            };
            if better {
                best = Some((ready, pkt.event_cycle, idx));
            }
        }
        best.map(|(_, _, idx)| (kind, idx))
    }

    /// Starts the selected request on its bank.
    fn service_packet(&mut self, selected: Option<(QueueKind, usize)>) -> u64 {
        let Some((kind, slot_idx)) = selected else { return 0 };
        let now = self.current_cycle;

        let (address, event_cycle) = match self.queue(kind)[slot_idx].as_ref() {
            Some(pkt) => (pkt.address, pkt.event_cycle),
            None => return 0,
        };
        if event_cycle > now {
            return 0;
        }

        let op_row = self.get_row(address);
        let op_idx = self.bank_index(address);
        let bank = &self.bank_request[op_idx];
        if bank.valid || bank.under_refresh {
            return 0;
        }

        let row_buffer_hit = bank.open_row == Some(op_row);
        let row_charge_delay = if bank.open_row.is_some() { self.t_rp + self.t_rcd } else { self.t_rcd };
        self.bank_request[op_idx] = BankRequest {
            valid: true,
            row_buffer_hit,
            need_refresh: false,
            under_refresh: false,
            open_row: Some(op_row),
            event_cycle: now + self.t_cas + if row_buffer_hit { 0 } else { row_charge_delay },
            slot: Some((kind, slot_idx)),
        };

        let pkt = self.queue_mut(kind)[slot_idx].as_mut().unwrap();
        pkt.scheduled = true;
        pkt.event_cycle = u64::MAX;
        1
    }

    /// Coalesces writes: a newer write to a block already queued is dropped.
    fn check_write_collision(&mut self) {
        for idx in 0..self.wq.len() {
            let Some(pkt) = &self.wq[idx] else { continue };
            if pkt.forward_checked {
                continue;
            }
            let block = pkt.address >> LOG2_BLOCK_SIZE;
            let dup = self
                .wq
                .iter()
                .enumerate()
                .any(|(other, slot)| other != idx && slot.as_ref().is_some_and(|x| x.address >> LOG2_BLOCK_SIZE == block));
            if dup {
                self.wq[idx] = None;
            } else {
                self.wq[idx].as_mut().unwrap().forward_checked = true;
            }
        }
    }

    /// Forwards reads from queued writes and merges duplicate reads.
    fn check_read_collision(&mut self, channels: &mut Channels) {
        for idx in 0..self.rq.len() {
            let Some(pkt) = &self.rq[idx] else { continue };
            if pkt.forward_checked {
                continue;
            }
            let block = pkt.address >> LOG2_BLOCK_SIZE;

            if let Some(wq_entry) = self
                .wq
                .iter()
                .flatten()
                .find(|x| x.address >> LOG2_BLOCK_SIZE == block)
            {
                // The write queue holds the freshest data for this block.
                let mut response = self.rq[idx].as_ref().unwrap().response();
                response.data = wq_entry.data;
                channels.push_response(&self.rq[idx].as_ref().unwrap().to_return, &response);
                self.rq[idx] = None;
            } else if let Some(other) = self.rq.iter().enumerate().position(|(other, slot)| {
                other != idx && slot.as_ref().is_some_and(|x| x.address >> LOG2_BLOCK_SIZE == block)
            }) {
                let absorbed = self.rq[idx].take().unwrap();
                let keep = self.rq[other].as_mut().unwrap();
                merge_program_order(&mut keep.instr_depend_on_me, &absorbed.instr_depend_on_me);
                for ret in absorbed.to_return {
                    if !keep.to_return.contains(&ret) {
                        keep.to_return.push(ret);
                    }
                }
            } else {
                self.rq[idx].as_mut().unwrap().forward_checked = true;
            }
        }
    }

    /// Read queue occupancy.
    pub fn rq_occupancy(&self) -> usize {
        self.rq.iter().filter(|x| x.is_some()).count()
    }

    /// Write queue occupancy.
    pub fn wq_occupancy(&self) -> usize {
        self.wq.iter().filter(|x| x.is_some()).count()
    }

    fn print_deadlock(&self) {
        for (label, queue) in [("RQ", &self.rq), ("WQ", &self.wq)] {
            let entries: Vec<_> = queue.iter().flatten().collect();
            if entries.is_empty() {
                println!("{} {} empty", self.stats.name, label);
            } else {
                for entry in entries {
                    println!(
                        "[{}_{}] address: {:#x} v_addr: {:#x} scheduled: {}",
                        self.stats.name, label, entry.address, entry.v_address, entry.scheduled
                    );
                }
            }
        }
    }
}

/// The memory controller: routes LLC traffic to its DRAM channels.
pub struct MemoryController {
    pub clock: Operable,
    queues: Vec<ChannelId>,
    pub channels: Vec<DramChannel>,
    current_cycle: u64,
}

impl MemoryController {
    /// Builds the controller and its channels.
    pub fn new(config: &DramConfig, queues: Vec<ChannelId>) -> Self {
        assert!(config.channels.is_power_of_two(), "channel count must be a power of two");
        let channels = (0..config.channels).map(|i| DramChannel::new(config, i)).collect();
        Self {
            clock: Operable::new(config.clock_period),
            queues,
            channels,
            current_cycle: 0,
        }
    }

    /// Routes an address to its channel.
    pub fn dram_get_channel(&self, address: u64) -> usize {
        ((address >> LOG2_BLOCK_SIZE) & bitmask(lg2(self.channels.len() as u64))) as usize
    }

    /// Propagates the warm-up flag to every channel.
    pub fn set_warmup(&mut self, warmup: bool) {
        for chan in &mut self.channels {
            chan.warmup = warmup;
        }
    }

    /// One clock edge: drain the upper channels, then tick every DRAM channel.
    pub fn operate(&mut self, arena: &mut Channels) -> u64 {
        self.current_cycle += 1;
        self.initiate_requests(arena);

        let mut progress = 0;
        for chan in &mut self.channels {
            progress += chan.operate(arena);
        }
        progress
    }

    /// Accepts requests from each upper channel, in queue order, stopping a
    /// queue at its first refusal.
    fn initiate_requests(&mut self, arena: &mut Channels) {
        for i in 0..self.queues.len() {
            let ul = self.queues[i];

            loop {
                let Some(front) = arena[ul].rq.front().cloned() else { break };
                if !self.add_rq(&front, ul) {
                    break;
                }
                arena[ul].rq.pop_front();
            }
            loop {
                let Some(front) = arena[ul].pq.front().cloned() else { break };
                if !self.add_rq(&front, ul) {
                    break;
                }
                arena[ul].pq.pop_front();
            }
            loop {
                let Some(front) = arena[ul].wq.front().cloned() else { break };
                if !self.add_wq(&front) {
                    break;
                }
                arena[ul].wq.pop_front();
            }
        }
    }

    fn add_rq(&mut self, packet: &Request, ul: ChannelId) -> bool {
        let now = self.current_cycle;
        let chan_idx = self.dram_get_channel(packet.address);
        let channel = &mut self.channels[chan_idx];

        if let Some(slot) = channel.rq.iter_mut().find(|slot| slot.is_none()) {
            let to_return = if packet.response_requested { vec![ul] } else { Vec::new() };
            *slot = Some(DramRequest::new(packet, now, to_return));
            return true;
        }
        false
    }

    fn add_wq(&mut self, packet: &Request) -> bool {
        let now = self.current_cycle;
        let chan_idx = self.dram_get_channel(packet.address);
        let channel = &mut self.channels[chan_idx];

        if let Some(slot) = channel.wq.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(DramRequest::new(packet, now, Vec::new()));
            return true;
        }
        channel.stats.wq_full += 1;
        false
    }

    /// Total addressable bytes.
    pub fn size(&self) -> u64 {
        let chan = &self.channels[0];
        (self.channels.len() * chan.ranks * chan.banks * chan.rows * chan.columns) as u64 * BLOCK_SIZE
    }

    /// Dumps every channel's queues when the watchdog trips.
    pub fn print_deadlock(&self) {
        for (i, chan) in self.channels.iter().enumerate() {
            println!("DRAM Channel {}", i);
            chan.print_deadlock();
        }
    }
}
