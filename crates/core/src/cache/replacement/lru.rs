//! Least-recently-used replacement.

use crate::cache::Block;
use crate::common::AccessType;

use super::Replacement;

/// True LRU: each way records the cycle of its last use; the victim is the
/// way with the most distant last use.
pub struct Lru {
    ways: usize,
    last_used_cycles: Vec<u64>,
    cycle: u64,
}

impl Lru {
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            ways,
            last_used_cycles: vec![0; sets * ways],
            cycle: 0,
        }
    }
}

impl Replacement for Lru {
    fn find_victim(
        &mut self,
        _cpu: usize,
        _instr_id: u64,
        set: usize,
        _blocks: &[Block],
        _ip: u64,
        _addr: u64,
        _kind: AccessType,
    ) -> usize {
        let begin = set * self.ways;
        let slice = &self.last_used_cycles[begin..begin + self.ways];
        slice
            .iter()
            .enumerate()
            .min_by_key(|(_, &cycle)| cycle)
            .map(|(way, _)| way)
            .unwrap()
    }

    fn update_replacement_state(
        &mut self,
        _cpu: usize,
        set: usize,
        way: usize,
        _addr: u64,
        _ip: u64,
        _victim_addr: u64,
        kind: AccessType,
        hit: bool,
    ) {
        // Writeback hits do not refresh recency.
        if !hit || kind != AccessType::Write {
            self.cycle += 1;
            self.last_used_cycles[set * self.ways + way] = self.cycle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_is_least_recent() {
        let mut lru = Lru::new(1, 4);
        for way in [0, 1, 2, 3, 0, 1, 3] {
            lru.update_replacement_state(0, 0, way, 0, 0, 0, AccessType::Load, true);
        }
        assert_eq!(lru.find_victim(0, 0, 0, &[], 0, 0, AccessType::Load), 2);
    }

    #[test]
    fn test_writeback_hit_does_not_refresh() {
        let mut lru = Lru::new(1, 2);
        lru.update_replacement_state(0, 0, 0, 0, 0, 0, AccessType::Load, true);
        lru.update_replacement_state(0, 0, 1, 0, 0, 0, AccessType::Load, true);
        // A writeback hit on way 0 leaves it least recent.
        lru.update_replacement_state(0, 0, 0, 0, 0, 0, AccessType::Write, true);
        assert_eq!(lru.find_victim(0, 0, 0, &[], 0, 0, AccessType::Load), 0);
    }
}
