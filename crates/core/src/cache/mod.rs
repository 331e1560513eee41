//! Generic set-associative cache with miss status holding registers.
//!
//! One implementation serves every level of the hierarchy: L1I, L1D, L2,
//! LLC, and (with page-granular tags) the TLBs. It provides:
//! 1. **Tag pipeline:** Budgeted tag-check admission and resolution with
//!    per-access-type hit/miss accounting.
//! 2. **MSHRs:** Outstanding-miss tracking with merge, prefetch promotion,
//!    and response-order preservation.
//! 3. **Translation handoff:** Virtually-accessed caches park untranslated
//!    lookups in a stash and resolve them through a translation channel.
//! 4. **Policy hooks:** A replacement policy and an optional prefetcher,
//!    composed at construction.
//!
//! All queue-full conditions return `false` and leave state untouched; the
//! caller retries on a later tick.

pub mod prefetch;
pub mod replacement;

use std::collections::VecDeque;

use tracing::debug;

use crate::channel::{ChannelId, Channels, Request, Response, merge_program_order};
use crate::common::{AccessType, PageNumber, PageOffset, bitmask};
use crate::config::CacheConfig;
use crate::operable::Operable;
use crate::stats::CacheStats;

use self::prefetch::Prefetcher;
use self::replacement::Replacement;

/// One cache block.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub valid: bool,
    pub dirty: bool,
    /// Set when the block was brought in by a prefetch and not yet touched
    /// by a demand access.
    pub prefetch: bool,
    pub address: u64,
    pub v_address: u64,
    pub data: u64,
    pub pf_metadata: u32,
}

/// A lookup admitted to the tag-check pipeline.
#[derive(Clone, Debug)]
struct TagLookup {
    address: u64,
    v_address: u64,
    data: u64,
    instr_id: u64,
    ip: u64,
    pf_metadata: u32,
    cpu: usize,
    asid: [u8; 2],
    kind: AccessType,
    /// The prefetch was issued by this cache's own prefetcher.
    prefetch_from_this: bool,
    /// A local prefetch that terminates at a lower level.
    skip_fill: bool,
    is_translated: bool,
    translate_issued: bool,
    event_cycle: u64,
    instr_depend_on_me: Vec<u64>,
    to_return: Vec<ChannelId>,
}

impl TagLookup {
    fn from_request(req: &Request, local_pref: bool, skip: bool) -> Self {
        Self {
            address: req.address,
            v_address: req.v_address,
            data: req.data,
            instr_id: req.instr_id,
            ip: req.ip,
            pf_metadata: req.pf_metadata,
            cpu: req.cpu,
            asid: req.asid,
            kind: req.kind,
            prefetch_from_this: local_pref,
            skip_fill: skip,
            is_translated: req.is_translated,
            translate_issued: false,
            event_cycle: 0,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
            to_return: Vec::new(),
        }
    }
}

/// An outstanding miss, or an in-flight writeback being treated like a fill.
#[derive(Clone, Debug)]
struct MshrEntry {
    address: u64,
    v_address: u64,
    data: u64,
    instr_id: u64,
    ip: u64,
    pf_metadata: u32,
    cpu: usize,
    kind: AccessType,
    prefetch_from_this: bool,
    cycle_enqueued: u64,
    /// Ready time; `u64::MAX` marks "no response from below yet".
    event_cycle: u64,
    instr_depend_on_me: Vec<u64>,
    to_return: Vec<ChannelId>,
}

impl MshrEntry {
    fn from_lookup(pkt: &TagLookup, cycle: u64) -> Self {
        Self {
            address: pkt.address,
            v_address: pkt.v_address,
            data: pkt.data,
            instr_id: pkt.instr_id,
            ip: pkt.ip,
            pf_metadata: pkt.pf_metadata,
            cpu: pkt.cpu,
            kind: pkt.kind,
            prefetch_from_this: pkt.prefetch_from_this,
            cycle_enqueued: cycle,
            event_cycle: u64::MAX,
            instr_depend_on_me: pkt.instr_depend_on_me.clone(),
            to_return: pkt.to_return.clone(),
        }
    }
}

/// A set-associative cache level.
pub struct Cache {
    pub name: String,
    pub clock: Operable,

    num_set: usize,
    num_way: usize,
    mshr_size: usize,
    pq_size: usize,
    hit_latency: u64,
    fill_latency: u64,
    max_tag: usize,
    max_fill: usize,
    offset_bits: u32,
    prefetch_as_load: bool,
    virtual_prefetch: bool,
    match_offset_bits: bool,
    pref_activate_mask: Vec<AccessType>,

    upper_levels: Vec<ChannelId>,
    lower_level: ChannelId,
    lower_translate: Option<ChannelId>,

    blocks: Vec<Block>,
    mshr: Vec<MshrEntry>,
    inflight_writes: Vec<MshrEntry>,
    inflight_tag_check: VecDeque<TagLookup>,
    translation_stash: Vec<TagLookup>,
    internal_pq: VecDeque<TagLookup>,

    replacement: Box<dyn Replacement>,
    prefetcher: Option<Box<dyn Prefetcher>>,

    cpu: usize,
    pub warmup: bool,
    current_cycle: u64,
    pub stats: CacheStats,
}

impl Cache {
    /// Builds a cache level and wires it to its neighbors.
    pub fn new(
        config: &CacheConfig,
        upper_levels: Vec<ChannelId>,
        lower_level: ChannelId,
        lower_translate: Option<ChannelId>,
    ) -> Self {
        assert!(config.sets.is_power_of_two(), "{}: set count must be a power of two", config.name);
        Self {
            name: config.name.clone(),
            clock: Operable::new(config.clock_period),
            num_set: config.sets,
            num_way: config.ways,
            mshr_size: config.mshr_size,
            pq_size: config.pq_size,
            hit_latency: config.hit_latency,
            fill_latency: config.fill_latency,
            max_tag: config.max_tag,
            max_fill: config.max_fill,
            offset_bits: config.offset_bits,
            prefetch_as_load: config.prefetch_as_load,
            virtual_prefetch: config.virtual_prefetch,
            match_offset_bits: config.match_offset_bits,
            pref_activate_mask: config.pref_activate.clone(),
            upper_levels,
            lower_level,
            lower_translate,
            blocks: vec![Block::default(); config.sets * config.ways],
            mshr: Vec::new(),
            inflight_writes: Vec::new(),
            inflight_tag_check: VecDeque::new(),
            translation_stash: Vec::new(),
            internal_pq: VecDeque::new(),
            replacement: replacement::build(config.replacement, config.sets, config.ways),
            prefetcher: Some(prefetch::build(config.prefetcher)),
            cpu: 0,
            warmup: false,
            current_cycle: 0,
            stats: CacheStats {
                name: config.name.clone(),
                ..CacheStats::default()
            },
        }
    }

    /// Runs policy initialization hooks.
    pub fn initialize(&mut self) {
        self.replacement.initialize_replacement();
        let mut pf = self.prefetcher.take().expect("prefetcher hook re-entered");
        pf.prefetcher_initialize();
        self.prefetcher = Some(pf);
    }

    /// Resets the measured statistics at a phase boundary.
    pub fn begin_phase(&mut self) {
        self.stats = CacheStats {
            name: self.name.clone(),
            ..CacheStats::default()
        };
    }

    /// Runs policy end-of-run hooks.
    pub fn final_stats(&mut self) {
        self.replacement.replacement_final_stats();
        let mut pf = self.prefetcher.take().expect("prefetcher hook re-entered");
        pf.prefetcher_final_stats();
        self.prefetcher = Some(pf);
    }

    #[inline]
    fn block_number(&self, address: u64) -> u64 {
        address >> self.offset_bits
    }

    /// Set index of an address: the bits directly above the offset.
    pub fn get_set_index(&self, address: u64) -> usize {
        ((address >> self.offset_bits) as usize) & (self.num_set - 1)
    }

    fn set_range(&self, address: u64) -> std::ops::Range<usize> {
        let set = self.get_set_index(address);
        set * self.num_way..(set + 1) * self.num_way
    }

    fn hit_lat(&self) -> u64 {
        if self.warmup { 0 } else { self.hit_latency }
    }

    fn fill_lat(&self) -> u64 {
        if self.warmup { 0 } else { self.fill_latency }
    }

    /// One clock edge.
    pub fn operate(&mut self, channels: &mut Channels) -> u64 {
        self.current_cycle += 1;
        let now = self.current_cycle;
        let mut progress = 0u64;

        // Collision pass on every upper channel.
        for &ul in &self.upper_levels {
            channels[ul].check_collision();
        }

        // Drain responses from below.
        while let Some(response) = channels[self.lower_level].returned.pop_front() {
            self.finish_packet(&response, now);
            progress += 1;
        }

        // Drain translation responses.
        if let Some(translate) = self.lower_translate {
            while let Some(response) = channels[translate].returned.pop_front() {
                self.finish_translation(&response);
                progress += 1;
            }
        }

        // Fills: MSHRs first, then in-flight writebacks. The budget counts
        // successes only; a refusal ends that list's pass for this tick.
        let mut fill_bw = self.max_fill;
        for source in [0, 1] {
            while fill_bw > 0 {
                let front = match source {
                    0 => self.mshr.first(),
                    _ => self.inflight_writes.first(),
                };
                let Some(entry) = front else { break };
                if entry.event_cycle > now {
                    break;
                }
                let entry = entry.clone();
                if !self.handle_fill(&entry, channels, now) {
                    break;
                }
                match source {
                    0 => {
                        self.mshr.remove(0);
                    }
                    _ => {
                        self.inflight_writes.remove(0);
                    }
                }
                fill_bw -= 1;
                progress += 1;
            }
        }

        // Tag-check admission. The pipeline depth bounds how much can be
        // admitted this cycle.
        let inflight = self.inflight_tag_check.len() as i64;
        let mut tag_bw = ((self.max_tag as i64 * self.hit_latency as i64) - inflight)
            .clamp(0, self.max_tag as i64) as usize;
        let stash_avail = self.translation_stash.len() < self.mshr_size;

        // Restart stashed lookups whose translation has arrived.
        let mut idx = 0;
        while idx < self.translation_stash.len() {
            if tag_bw == 0 {
                break;
            }
            if self.translation_stash[idx].is_translated {
                let mut entry = self.translation_stash.remove(idx);
                entry.event_cycle = now + self.hit_lat();
                self.inflight_tag_check.push_back(entry);
                tag_bw -= 1;
                progress += 1;
            } else {
                idx += 1;
            }
        }

        // Admit from each upper channel: writebacks, then reads, then
        // prefetches. An entry may enter untranslated only if the stash has
        // room for it later.
        for ul_idx in 0..self.upper_levels.len() {
            let ul = self.upper_levels[ul_idx];
            for queue in 0..3 {
                while tag_bw > 0 {
                    let channel = &mut channels[ul];
                    let q = match queue {
                        0 => &mut channel.wq,
                        1 => &mut channel.rq,
                        _ => &mut channel.pq,
                    };
                    let Some(front) = q.front() else { break };
                    if !front.is_translated && !stash_avail {
                        break;
                    }
                    let req = q.pop_front().unwrap();
                    let mut entry = TagLookup::from_request(&req, false, false);
                    if req.response_requested {
                        entry.to_return = vec![ul];
                    }
                    entry.event_cycle = now + self.hit_lat();
                    self.inflight_tag_check.push_back(entry);
                    tag_bw -= 1;
                    progress += 1;
                }
            }
        }

        // Admit internally generated prefetches.
        while tag_bw > 0 {
            let Some(front) = self.internal_pq.front() else { break };
            if !front.is_translated && !stash_avail {
                break;
            }
            let mut entry = self.internal_pq.pop_front().unwrap();
            entry.event_cycle = now + self.hit_lat();
            self.inflight_tag_check.push_back(entry);
            tag_bw -= 1;
            progress += 1;
        }

        // Ask the translation channel about every untranslated lookup.
        self.issue_translation(channels);

        // Lookups that are due but still untranslated wait in the stash.
        let mut idx = 0;
        while idx < self.inflight_tag_check.len() {
            let entry = &self.inflight_tag_check[idx];
            if entry.event_cycle < now && !entry.is_translated && entry.translate_issued {
                let entry = self.inflight_tag_check.remove(idx).unwrap();
                self.translation_stash.push(entry);
            } else {
                idx += 1;
            }
        }

        // Tag-check resolution, in admission order, stopping at the first
        // refusal (back-pressure).
        let mut check_bw = self.max_tag;
        while check_bw > 0 {
            let Some(front) = self.inflight_tag_check.front() else { break };
            if front.event_cycle > now || !front.is_translated {
                break;
            }
            let pkt = self.inflight_tag_check.pop_front().unwrap();
            if self.do_tag_check(&pkt, channels, now) {
                check_bw -= 1;
                progress += 1;
            } else {
                self.inflight_tag_check.push_front(pkt);
                break;
            }
        }

        // Prefetcher cycle hook.
        let mut pf = self.prefetcher.take().expect("prefetcher hook re-entered");
        pf.prefetcher_cycle_operate(self);
        self.prefetcher = Some(pf);

        progress
    }

    fn do_tag_check(&mut self, pkt: &TagLookup, channels: &mut Channels, now: u64) -> bool {
        if self.try_hit(pkt, channels) {
            return true;
        }
        if pkt.kind == AccessType::Write && !self.match_offset_bits {
            // Writebacks fill this level directly.
            self.handle_write(pkt, now)
        } else {
            // Stores behave like reads from here down.
            self.handle_miss(pkt, channels, now)
        }
    }

    /// The address the prefetcher sees: virtual or physical per
    /// configuration, with the offset bits dropped unless they are tagged.
    fn prefetch_base(&self, address: u64, v_address: u64) -> u64 {
        let base = if self.virtual_prefetch { v_address } else { address };
        if self.match_offset_bits {
            base
        } else {
            base & !bitmask(self.offset_bits)
        }
    }

    fn should_activate_prefetcher(&self, pkt: &TagLookup) -> bool {
        !pkt.prefetch_from_this && self.pref_activate_mask.contains(&pkt.kind)
    }

    fn try_hit(&mut self, pkt: &TagLookup, channels: &mut Channels) -> bool {
        self.cpu = pkt.cpu;
        let range = self.set_range(pkt.address);
        let tag = self.block_number(pkt.address);
        let way = self.blocks[range.clone()]
            .iter()
            .position(|b| b.valid && self.block_number(b.address) == tag);
        let hit = way.is_some();
        let useful_prefetch = way
            .map(|w| self.blocks[range.start + w].prefetch && !pkt.prefetch_from_this)
            .unwrap_or(false);

        debug!(
            cache = %self.name,
            instr_id = pkt.instr_id,
            address = pkt.address,
            kind = pkt.kind.name(),
            hit,
            cycle = self.current_cycle,
            "tag check"
        );

        let mut metadata_thru = pkt.pf_metadata;
        if self.should_activate_prefetcher(pkt) {
            let base = self.prefetch_base(pkt.address, pkt.v_address);
            let mut pf = self.prefetcher.take().expect("prefetcher hook re-entered");
            metadata_thru =
                pf.prefetcher_cache_operate(self, base, pkt.ip, hit, useful_prefetch, pkt.kind, metadata_thru);
            self.prefetcher = Some(pf);
        }

        if let Some(w) = way {
            self.stats.record_hit(pkt.kind);
            let slot = range.start + w;
            let set = self.get_set_index(pkt.address);
            let block_addr = self.blocks[slot].address;
            self.replacement
                .update_replacement_state(pkt.cpu, set, w, block_addr, pkt.ip, 0, pkt.kind, true);

            let response = Response {
                address: pkt.address,
                v_address: pkt.v_address,
                data: self.blocks[slot].data,
                pf_metadata: metadata_thru,
                instr_depend_on_me: pkt.instr_depend_on_me.clone(),
            };
            channels.push_response(&pkt.to_return, &response);

            if pkt.kind == AccessType::Write {
                self.blocks[slot].dirty = true;
            }
            if useful_prefetch {
                self.stats.pf_useful += 1;
                self.blocks[slot].prefetch = false;
            }
        }

        hit
    }

    fn handle_miss(&mut self, pkt: &TagLookup, channels: &mut Channels, now: u64) -> bool {
        self.cpu = pkt.cpu;
        let block = self.block_number(pkt.address);
        let existing = self.mshr.iter().position(|m| self.block_number(m.address) == block);

        if let Some(idx) = existing {
            // The miss is already in flight: merge, and promote a prefetch
            // hit by a demand access.
            let entry = &mut self.mshr[idx];
            merge_program_order(&mut entry.instr_depend_on_me, &pkt.instr_depend_on_me);
            for &ret in &pkt.to_return {
                if !entry.to_return.contains(&ret) {
                    entry.to_return.push(ret);
                }
            }

            if entry.kind == AccessType::Prefetch && pkt.kind != AccessType::Prefetch {
                if entry.prefetch_from_this {
                    self.stats.pf_useful += 1;
                }
                let prior_event_cycle = entry.event_cycle;
                let prior_to_return = std::mem::take(&mut entry.to_return);
                *entry = MshrEntry::from_lookup(pkt, now);
                // The request may already have returned; keep its timing.
                entry.event_cycle = prior_event_cycle;
                entry.to_return = prior_to_return;
            }
        } else {
            if self.mshr.len() == self.mshr_size {
                return false;
            }

            let fwd = Request {
                address: pkt.address,
                v_address: pkt.v_address,
                data: pkt.data,
                instr_id: pkt.instr_id,
                ip: pkt.ip,
                pf_metadata: pkt.pf_metadata,
                cpu: pkt.cpu,
                asid: pkt.asid,
                kind: if pkt.kind == AccessType::Write {
                    AccessType::Rfo
                } else {
                    pkt.kind
                },
                response_requested: !pkt.prefetch_from_this || !pkt.skip_fill,
                is_translated: pkt.is_translated,
                instr_depend_on_me: pkt.instr_depend_on_me.clone(),
                forward_checked: false,
            };

            let send_to_rq = self.prefetch_as_load || pkt.kind != AccessType::Prefetch;
            let response_requested = fwd.response_requested;
            let pf_metadata = fwd.pf_metadata;
            let lower = &mut channels[self.lower_level];
            let success = if send_to_rq { lower.add_rq(fwd) } else { lower.add_pq(fwd) };
            if !success {
                return false;
            }

            if response_requested {
                let mut entry = MshrEntry::from_lookup(pkt, now);
                entry.pf_metadata = pf_metadata;
                self.mshr.push(entry);
            }
        }

        self.stats.record_miss(pkt.kind);
        true
    }

    fn handle_write(&mut self, pkt: &TagLookup, now: u64) -> bool {
        let mut entry = MshrEntry::from_lookup(pkt, now);
        entry.event_cycle = now + self.fill_lat();
        self.inflight_writes.push(entry);
        self.stats.record_miss(pkt.kind);
        true
    }

    fn handle_fill(&mut self, fill: &MshrEntry, channels: &mut Channels, now: u64) -> bool {
        self.cpu = fill.cpu;
        let range = self.set_range(fill.address);
        let set = self.get_set_index(fill.address);

        let way = match self.blocks[range.clone()].iter().position(|b| !b.valid) {
            Some(way) => way,
            None => self.replacement.find_victim(
                fill.cpu,
                fill.instr_id,
                set,
                &self.blocks[range.clone()],
                fill.ip,
                fill.address,
                fill.kind,
            ),
        };
        let bypass = way >= self.num_way;
        debug_assert!(!(bypass && fill.kind == AccessType::Write), "{}: writes may not bypass", self.name);

        // A valid dirty victim must be written back before the fill can
        // land; a refused writeback aborts the fill for this tick.
        if !bypass {
            let victim = &self.blocks[range.start + way];
            if victim.valid && victim.dirty {
                let writeback = Request {
                    address: victim.address,
                    v_address: victim.v_address,
                    data: victim.data,
                    instr_id: fill.instr_id,
                    ip: 0,
                    pf_metadata: victim.pf_metadata,
                    cpu: fill.cpu,
                    asid: [u8::MAX, u8::MAX],
                    kind: AccessType::Write,
                    response_requested: false,
                    is_translated: true,
                    instr_depend_on_me: Vec::new(),
                    forward_checked: false,
                };
                if !channels[self.lower_level].add_wq(writeback) {
                    return false;
                }
            }
        }

        let evicting_address = if !bypass && self.blocks[range.start + way].valid {
            let victim = &self.blocks[range.start + way];
            let addr = if self.virtual_prefetch { victim.address } else { victim.v_address };
            addr & !bitmask(if self.match_offset_bits { 0 } else { self.offset_bits })
        } else {
            0
        };

        let pkt_address = self.prefetch_base(fill.address, fill.v_address);
        let mut pf = self.prefetcher.take().expect("prefetcher hook re-entered");
        let metadata_thru = pf.prefetcher_cache_fill(
            self,
            pkt_address,
            set,
            way,
            fill.kind == AccessType::Prefetch,
            evicting_address,
            fill.pf_metadata,
        );
        self.prefetcher = Some(pf);
        self.replacement
            .update_replacement_state(fill.cpu, set, way, fill.address, fill.ip, evicting_address, fill.kind, false);

        if !bypass {
            let slot = range.start + way;
            if self.blocks[slot].valid && self.blocks[slot].prefetch {
                self.stats.pf_useless += 1;
            }
            if fill.kind == AccessType::Prefetch {
                self.stats.pf_fill += 1;
            }
            self.blocks[slot] = Block {
                valid: true,
                dirty: fill.kind == AccessType::Write,
                prefetch: fill.prefetch_from_this,
                address: fill.address,
                v_address: fill.v_address,
                data: fill.data,
                pf_metadata: metadata_thru,
            };
        }

        self.stats.total_miss_latency += now.saturating_sub(fill.cycle_enqueued + 1);

        debug!(
            cache = %self.name,
            instr_id = fill.instr_id,
            address = fill.address,
            set,
            way,
            kind = fill.kind.name(),
            cycle = now,
            "fill"
        );

        let response = Response {
            address: fill.address,
            v_address: fill.v_address,
            data: fill.data,
            pf_metadata: metadata_thru,
            instr_depend_on_me: fill.instr_depend_on_me.clone(),
        };
        channels.push_response(&fill.to_return, &response);

        true
    }

    /// Handles a response from the lower level.
    ///
    /// The matching MSHR becomes ready after the fill latency, swapped ahead
    /// of all not-yet-returned entries so completion preserves the order in
    /// which responses arrived.
    fn finish_packet(&mut self, packet: &Response, now: u64) {
        let block = self.block_number(packet.address);
        let Some(idx) = self.mshr.iter().position(|m| self.block_number(m.address) == block) else {
            panic!(
                "[{}_MSHR] no matching entry! address: {:#x} v_address: {:#x}",
                self.name, packet.address, packet.v_address
            );
        };

        self.mshr[idx].data = packet.data;
        self.mshr[idx].pf_metadata = packet.pf_metadata;
        self.mshr[idx].event_cycle = now + self.fill_lat();

        let first_unreturned = self
            .mshr
            .iter()
            .position(|m| m.event_cycle == u64::MAX)
            .unwrap_or(self.mshr.len() - 1);
        self.mshr.swap(idx, first_unreturned.min(idx));
    }

    /// Patches every queued lookup on the returned translation's page.
    fn finish_translation(&mut self, packet: &Response) {
        let vpage = PageNumber::from_addr(packet.v_address);
        let frame = PageNumber::from_addr(packet.data);
        let patch = |entry: &mut TagLookup| {
            if !entry.is_translated && PageNumber::from_addr(entry.v_address) == vpage {
                entry.address = frame.splice(PageOffset::from_addr(entry.v_address));
                entry.is_translated = true;
            }
        };
        self.translation_stash.iter_mut().for_each(patch);
        self.inflight_tag_check.iter_mut().for_each(patch);
    }

    /// Issues a translation request for every untranslated in-flight lookup
    /// that has not asked yet. A refused request stays unissued.
    fn issue_translation(&mut self, channels: &mut Channels) {
        let Some(translate) = self.lower_translate else { return };
        for entry in self.inflight_tag_check.iter_mut() {
            if entry.translate_issued || entry.is_translated {
                continue;
            }
            let fwd = Request {
                address: entry.address,
                v_address: entry.v_address,
                data: entry.data,
                instr_id: entry.instr_id,
                ip: entry.ip,
                pf_metadata: 0,
                cpu: entry.cpu,
                asid: entry.asid,
                kind: AccessType::Translation,
                response_requested: true,
                is_translated: true,
                instr_depend_on_me: entry.instr_depend_on_me.clone(),
                forward_checked: false,
            };
            entry.translate_issued = channels[translate].add_rq(fwd);
        }
    }

    /// Feeds a resolved branch to the prefetcher (instruction prefetchers
    /// track control flow).
    pub fn prefetcher_branch_operate(&mut self, ip: u64, branch_type: crate::core::instruction::BranchType, target: u64) {
        let mut pf = self.prefetcher.take().expect("prefetcher hook re-entered");
        pf.prefetcher_branch_operate(self, ip, branch_type, target);
        self.prefetcher = Some(pf);
    }

    /// Queues a prefetch generated by this cache's prefetcher.
    ///
    /// `fill_this_level == false` marks the prefetch to terminate at a lower
    /// level. Returns false when the internal prefetch queue is full.
    pub fn prefetch_line(&mut self, pf_addr: u64, fill_this_level: bool, prefetch_metadata: u32) -> bool {
        self.stats.pf_requested += 1;
        if self.internal_pq.len() >= self.pq_size {
            return false;
        }

        let req = Request {
            address: pf_addr,
            v_address: if self.virtual_prefetch { pf_addr } else { 0 },
            pf_metadata: prefetch_metadata,
            cpu: self.cpu,
            kind: AccessType::Prefetch,
            is_translated: !self.virtual_prefetch,
            ..Request::default()
        };
        self.internal_pq.push_back(TagLookup::from_request(&req, true, !fill_this_level));
        self.stats.pf_issued += 1;
        true
    }

    /// Invalidates the block holding `inval_addr`, if present.
    pub fn invalidate_entry(&mut self, inval_addr: u64) -> Option<usize> {
        let range = self.set_range(inval_addr);
        let tag = self.block_number(inval_addr);
        let way = self.blocks[range.clone()]
            .iter()
            .position(|b| b.valid && self.block_number(b.address) == tag);
        if let Some(w) = way {
            self.blocks[range.start + w].valid = false;
        }
        way
    }

    /// Outstanding-miss occupancy.
    pub fn mshr_occupancy(&self) -> usize {
        self.mshr.len()
    }

    /// Outstanding-miss capacity.
    pub fn mshr_size(&self) -> usize {
        self.mshr_size
    }

    /// Internal prefetch queue occupancy.
    pub fn internal_pq_occupancy(&self) -> usize {
        self.internal_pq.len()
    }

    /// Dumps queue contents when the watchdog trips.
    pub fn print_deadlock(&self, channels: &Channels) {
        if self.mshr.is_empty() {
            println!("{} MSHR empty", self.name);
        } else {
            for (i, entry) in self.mshr.iter().enumerate() {
                println!(
                    "[{}_MSHR] entry: {} instr_id: {} address: {:#x} v_addr: {:#x} type: {} event_cycle: {}",
                    self.name, i, entry.instr_id, entry.address, entry.v_address,
                    entry.kind.name(), entry.event_cycle
                );
            }
        }
        for &ul in &self.upper_levels {
            let channel = &channels[ul];
            for (label, queue) in [("RQ", &channel.rq), ("WQ", &channel.wq), ("PQ", &channel.pq)] {
                if queue.is_empty() {
                    println!("{} {} empty", self.name, label);
                } else {
                    for entry in queue {
                        println!(
                            "[{}_{}] instr_id: {} address: {:#x} v_addr: {:#x} type: {}",
                            self.name, label, entry.instr_id, entry.address, entry.v_address,
                            entry.kind.name()
                        );
                    }
                }
            }
        }
    }
}
