//! Uniform random replacement.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::Block;
use crate::common::AccessType;

use super::Replacement;

/// Picks a uniformly random victim way. Deterministic across runs: the
/// generator is seeded at construction.
pub struct Random {
    ways: usize,
    rng: StdRng,
}

impl Random {
    pub fn new(ways: usize) -> Self {
        Self {
            ways,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }
}

impl Replacement for Random {
    fn find_victim(
        &mut self,
        _cpu: usize,
        _instr_id: u64,
        _set: usize,
        _blocks: &[Block],
        _ip: u64,
        _addr: u64,
        _kind: AccessType,
    ) -> usize {
        self.rng.gen_range(0..self.ways)
    }

    fn update_replacement_state(
        &mut self,
        _cpu: usize,
        _set: usize,
        _way: usize,
        _addr: u64,
        _ip: u64,
        _victim_addr: u64,
        _kind: AccessType,
        _hit: bool,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_in_range() {
        let mut policy = Random::new(8);
        for _ in 0..100 {
            let way = policy.find_victim(0, 0, 0, &[], 0, 0, AccessType::Load);
            assert!(way < 8);
        }
    }
}
