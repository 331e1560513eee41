//! Point-to-point request/response channels.
//!
//! A channel links exactly two components: the upstream component appends to
//! the read, write, and prefetch queues, and the owning (downstream)
//! component drains them, pushing answers onto `returned`. This module
//! provides:
//! 1. **Queues:** Bounded RQ/WQ/PQ plus the response queue, with occupancy stats.
//! 2. **Collision handling:** Block-aligned merging and WQ-to-RQ forwarding,
//!    run by the owner before it reads its inbound queues.
//! 3. **Arena:** All channels live in a [`Channels`] arena and are referenced
//!    by [`ChannelId`], so the component graph holds handles, never pointers.

use std::collections::VecDeque;

use crate::common::{AccessType, bitmask};

/// Handle to a channel in the [`Channels`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) usize);

/// A request travelling down the hierarchy.
#[derive(Clone, Debug)]
pub struct Request {
    /// Physical address (meaningful once `is_translated`).
    pub address: u64,
    /// Virtual address, when the request was born untranslated.
    pub v_address: u64,
    /// 64-byte block payload, modelled as a single word.
    pub data: u64,
    /// Id of the initiating instruction.
    pub instr_id: u64,
    /// Instruction pointer of the initiating instruction.
    pub ip: u64,
    /// Prefetcher metadata passed through the hierarchy.
    pub pf_metadata: u32,
    /// Index of the initiating CPU.
    pub cpu: usize,
    /// Address-space identifiers.
    pub asid: [u8; 2],
    /// Access type.
    pub kind: AccessType,
    /// When false the requester does not expect a response.
    pub response_requested: bool,
    /// Whether `address` already holds a physical address.
    pub is_translated: bool,
    /// Ids of instructions waiting on this request.
    pub instr_depend_on_me: Vec<u64>,
    /// Set once the collision pass has inspected this entry.
    pub forward_checked: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            address: 0,
            v_address: 0,
            data: 0,
            instr_id: 0,
            ip: 0,
            pf_metadata: 0,
            cpu: 0,
            asid: [u8::MAX, u8::MAX],
            kind: AccessType::Load,
            response_requested: true,
            is_translated: true,
            instr_depend_on_me: Vec::new(),
            forward_checked: false,
        }
    }
}

/// A response travelling back up the hierarchy.
#[derive(Clone, Debug)]
pub struct Response {
    pub address: u64,
    pub v_address: u64,
    pub data: u64,
    pub pf_metadata: u32,
    pub instr_depend_on_me: Vec<u64>,
}

impl Response {
    /// Builds the response for a request, carrying the given data word.
    pub fn for_request(req: &Request, data: u64) -> Self {
        Self {
            address: req.address,
            v_address: req.v_address,
            data,
            pf_metadata: req.pf_metadata,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
        }
    }
}

/// Per-queue traffic counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueCounters {
    /// Enqueue attempts.
    pub access: u64,
    /// Entries dropped into an earlier entry for the same block.
    pub merged: u64,
    /// Rejected enqueues.
    pub full: u64,
    /// Entries accepted by the owner.
    pub to_cache: u64,
}

/// Channel statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelStats {
    pub rq: QueueCounters,
    pub wq: QueueCounters,
    pub pq: QueueCounters,
    /// Read requests answered directly from a pending write.
    pub wq_forward: u64,
}

/// The queue bundle linking two components.
pub struct Channel {
    pub rq: VecDeque<Request>,
    pub wq: VecDeque<Request>,
    pub pq: VecDeque<Request>,
    pub returned: VecDeque<Response>,
    rq_size: usize,
    wq_size: usize,
    pq_size: usize,
    offset_bits: u32,
    match_offset_bits: bool,
    pub stats: ChannelStats,
}

/// Merges `src` into `dst`, both sorted ascending, keeping program order and
/// dropping duplicates.
pub fn merge_program_order(dst: &mut Vec<u64>, src: &[u64]) {
    let mut merged = Vec::with_capacity(dst.len() + src.len());
    let (mut i, mut j) = (0, 0);
    while i < dst.len() && j < src.len() {
        match dst[i].cmp(&src[j]) {
            std::cmp::Ordering::Less => {
                merged.push(dst[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                merged.push(src[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                merged.push(dst[i]);
                i += 1;
                j += 1;
            }
        }
    }
    merged.extend_from_slice(&dst[i..]);
    merged.extend_from_slice(&src[j..]);
    *dst = merged;
}

impl Channel {
    /// Creates a channel with the given queue capacities.
    ///
    /// `match_offset_bits` makes the write-forward comparison use the full
    /// address rather than the block number (TLB channels).
    pub fn new(rq_size: usize, pq_size: usize, wq_size: usize, offset_bits: u32, match_offset_bits: bool) -> Self {
        Self {
            rq: VecDeque::new(),
            wq: VecDeque::new(),
            pq: VecDeque::new(),
            returned: VecDeque::new(),
            rq_size,
            wq_size,
            pq_size,
            offset_bits,
            match_offset_bits,
            stats: ChannelStats::default(),
        }
    }

    fn write_shamt(&self) -> u32 {
        if self.match_offset_bits { 0 } else { self.offset_bits }
    }

    /// Appends a read request. Returns false when the queue is full.
    pub fn add_rq(&mut self, req: Request) -> bool {
        self.stats.rq.access += 1;
        if self.rq.len() >= self.rq_size {
            self.stats.rq.full += 1;
            return false;
        }
        self.stats.rq.to_cache += 1;
        self.rq.push_back(req);
        true
    }

    /// Appends a write (or writeback). Returns false when the queue is full.
    pub fn add_wq(&mut self, req: Request) -> bool {
        self.stats.wq.access += 1;
        if self.wq.len() >= self.wq_size {
            self.stats.wq.full += 1;
            return false;
        }
        self.stats.wq.to_cache += 1;
        self.wq.push_back(req);
        true
    }

    /// Appends a prefetch. Returns false when the queue is full.
    pub fn add_pq(&mut self, req: Request) -> bool {
        self.stats.pq.access += 1;
        if self.pq.len() >= self.pq_size {
            self.stats.pq.full += 1;
            return false;
        }
        self.stats.pq.to_cache += 1;
        self.pq.push_back(req);
        true
    }

    /// Runs the collision pass over all outgoing queues.
    ///
    /// Within each queue, a later entry whose block matches an earlier entry
    /// is merged into it. A read whose block matches a pending write is
    /// answered from the write's data without descending further.
    pub fn check_collision(&mut self) {
        let write_shamt = self.write_shamt();
        let read_shamt = self.offset_bits;

        // Writes: drop later duplicates.
        let mut idx = 0;
        while idx < self.wq.len() {
            if self.wq[idx].forward_checked {
                idx += 1;
                continue;
            }
            let addr = self.wq[idx].address >> write_shamt;
            let dup = self.wq.iter().take(idx).any(|x| x.address >> write_shamt == addr);
            if dup {
                self.stats.wq.merged += 1;
                self.wq.remove(idx);
            } else {
                self.wq[idx].forward_checked = true;
                idx += 1;
            }
        }

        // Reads: forward from pending writes, else merge with earlier reads.
        let mut idx = 0;
        while idx < self.rq.len() {
            if self.rq[idx].forward_checked {
                idx += 1;
                continue;
            }
            let addr = self.rq[idx].address;
            if let Some(wq_entry) = self.wq.iter().find(|x| x.address >> write_shamt == addr >> write_shamt) {
                self.stats.wq_forward += 1;
                let data = wq_entry.data;
                let entry = &self.rq[idx];
                if entry.response_requested {
                    self.returned.push_back(Response::for_request(entry, data));
                }
                self.rq.remove(idx);
            } else if let Some(earlier) = Self::earlier_match(&self.rq, idx, read_shamt) {
                self.stats.rq.merged += 1;
                let absorbed = self.rq.remove(idx).unwrap();
                let keep = &mut self.rq[earlier];
                merge_program_order(&mut keep.instr_depend_on_me, &absorbed.instr_depend_on_me);
                keep.response_requested |= absorbed.response_requested;
            } else {
                self.rq[idx].forward_checked = true;
                idx += 1;
            }
        }

        // Prefetches: same treatment as reads.
        let mut idx = 0;
        while idx < self.pq.len() {
            if self.pq[idx].forward_checked {
                idx += 1;
                continue;
            }
            let addr = self.pq[idx].address;
            if let Some(wq_entry) = self.wq.iter().find(|x| x.address >> write_shamt == addr >> write_shamt) {
                self.stats.wq_forward += 1;
                let data = wq_entry.data;
                let entry = &self.pq[idx];
                if entry.response_requested {
                    self.returned.push_back(Response::for_request(entry, data));
                }
                self.pq.remove(idx);
            } else if let Some(earlier) = Self::earlier_match(&self.pq, idx, read_shamt) {
                self.stats.pq.merged += 1;
                let absorbed = self.pq.remove(idx).unwrap();
                let keep = &mut self.pq[earlier];
                merge_program_order(&mut keep.instr_depend_on_me, &absorbed.instr_depend_on_me);
                keep.response_requested |= absorbed.response_requested;
            } else {
                self.pq[idx].forward_checked = true;
                idx += 1;
            }
        }
    }

    fn earlier_match(queue: &VecDeque<Request>, idx: usize, shamt: u32) -> Option<usize> {
        let addr = queue[idx].address >> shamt;
        queue.iter().take(idx).position(|x| x.address >> shamt == addr)
    }

    /// Occupancies, for deadlock dumps and occupancy-ratio stats.
    pub fn rq_occupancy(&self) -> usize {
        self.rq.len()
    }
    pub fn wq_occupancy(&self) -> usize {
        self.wq.len()
    }
    pub fn pq_occupancy(&self) -> usize {
        self.pq.len()
    }
    pub fn rq_size(&self) -> usize {
        self.rq_size
    }
    pub fn wq_size(&self) -> usize {
        self.wq_size
    }
    pub fn pq_size(&self) -> usize {
        self.pq_size
    }

    /// Block-aligns an address with this channel's offset width.
    pub fn block_of(&self, address: u64) -> u64 {
        address & !bitmask(self.offset_bits)
    }
}

/// Arena owning every channel in the machine.
#[derive(Default)]
pub struct Channels {
    pool: Vec<Channel>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a channel and returns its handle.
    pub fn create(&mut self, rq_size: usize, pq_size: usize, wq_size: usize, offset_bits: u32, match_offset_bits: bool) -> ChannelId {
        self.pool.push(Channel::new(rq_size, pq_size, wq_size, offset_bits, match_offset_bits));
        ChannelId(self.pool.len() - 1)
    }

    /// Pushes a response onto each listed channel's return queue.
    pub fn push_response(&mut self, to_return: &[ChannelId], response: &Response) {
        for &id in to_return {
            self[id].returned.push_back(response.clone());
        }
    }
}

impl std::ops::Index<ChannelId> for Channels {
    type Output = Channel;

    fn index(&self, id: ChannelId) -> &Channel {
        &self.pool[id.0]
    }
}

impl std::ops::IndexMut<ChannelId> for Channels {
    fn index_mut(&mut self, id: ChannelId) -> &mut Channel {
        &mut self.pool[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LOG2_BLOCK_SIZE;

    fn read_to(addr: u64) -> Request {
        Request {
            address: addr,
            v_address: addr,
            ..Request::default()
        }
    }

    #[test]
    fn test_overflow_returns_false() {
        let mut ch = Channel::new(1, 1, 1, LOG2_BLOCK_SIZE, false);
        assert!(ch.add_rq(read_to(0x1000)));
        assert!(!ch.add_rq(read_to(0x2000)));
        assert_eq!(ch.stats.rq.full, 1);
    }

    #[test]
    fn test_rq_merge_same_block() {
        let mut ch = Channel::new(4, 4, 4, LOG2_BLOCK_SIZE, false);
        let mut first = read_to(0x1000);
        first.instr_depend_on_me = vec![1];
        let mut second = read_to(0x1008);
        second.instr_depend_on_me = vec![2];
        ch.add_rq(first);
        ch.add_rq(second);
        ch.check_collision();
        assert_eq!(ch.rq.len(), 1);
        assert_eq!(ch.rq[0].instr_depend_on_me, vec![1, 2]);
        assert_eq!(ch.stats.rq.merged, 1);
    }

    #[test]
    fn test_wq_forwards_to_rq() {
        let mut ch = Channel::new(4, 4, 4, LOG2_BLOCK_SIZE, false);
        let mut write = read_to(0x1000);
        write.kind = AccessType::Write;
        write.data = 0xabcd;
        ch.add_wq(write);
        ch.add_rq(read_to(0x1010));
        ch.check_collision();
        assert!(ch.rq.is_empty());
        assert_eq!(ch.returned.len(), 1);
        assert_eq!(ch.returned[0].data, 0xabcd);
        assert_eq!(ch.stats.wq_forward, 1);
    }

    #[test]
    fn test_wq_coalesces_duplicates() {
        let mut ch = Channel::new(4, 4, 4, LOG2_BLOCK_SIZE, false);
        ch.add_wq(read_to(0x1000));
        ch.add_wq(read_to(0x1020));
        ch.check_collision();
        assert_eq!(ch.wq.len(), 1);
        assert_eq!(ch.stats.wq.merged, 1);
    }

    #[test]
    fn test_merge_program_order() {
        let mut dst = vec![1, 4, 9];
        merge_program_order(&mut dst, &[2, 4, 10]);
        assert_eq!(dst, vec![1, 2, 4, 9, 10]);
    }
}
