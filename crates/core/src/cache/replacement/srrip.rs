//! Static re-reference interval prediction (SRRIP) replacement.

use crate::cache::Block;
use crate::common::AccessType;

use super::Replacement;

/// Maximum re-reference prediction value (2-bit RRPV).
const MAX_RRPV: u8 = 3;

/// SRRIP: blocks enter with a long predicted re-reference interval and are
/// promoted on hits; the victim is any way already at the maximum interval,
/// aging the whole set until one appears.
pub struct Srrip {
    ways: usize,
    rrpv: Vec<u8>,
}

impl Srrip {
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            ways,
            rrpv: vec![MAX_RRPV; sets * ways],
        }
    }
}

impl Replacement for Srrip {
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
        loop {
            if let Some(way) = self.rrpv[begin..begin + self.ways]
                .iter()
                .position(|&v| v == MAX_RRPV)
            {
                return way;
            }
            for v in &mut self.rrpv[begin..begin + self.ways] {
                *v += 1;
            }
        }
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
        if hit && kind == AccessType::Write {
            return;
        }
        let slot = set * self.ways + way;
        self.rrpv[slot] = if hit { 0 } else { MAX_RRPV - 1 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_block_long_interval() {
        let mut srrip = Srrip::new(1, 2);
        srrip.update_replacement_state(0, 0, 0, 0, 0, 0, AccessType::Load, false);
        srrip.update_replacement_state(0, 0, 1, 0, 0, 0, AccessType::Load, false);
        // Hit promotes way 1 to near re-reference; way 0 becomes the victim
        // after aging.
        srrip.update_replacement_state(0, 0, 1, 0, 0, 0, AccessType::Load, true);
        assert_eq!(srrip.find_victim(0, 0, 0, &[], 0, 0, AccessType::Load), 0);
    }
}
