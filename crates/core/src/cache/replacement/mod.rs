//! Cache replacement policy implementations.
//!
//! A cache composes exactly one replacement policy. The policy sees every
//! fill and every tag-check hit and chooses the victim way on fills that
//! find no invalid way. A policy may return a way index equal to the
//! associativity to bypass the fill entirely (writes may not bypass).

pub mod lru;
pub mod random;
pub mod srrip;

pub use self::lru::Lru;
pub use self::random::Random;
pub use self::srrip::Srrip;

use crate::cache::Block;
use crate::common::AccessType;
use crate::config::ReplacementKind;

/// Operations a replacement policy must provide.
pub trait Replacement: Send {
    /// One-time setup after the cache is constructed.
    fn initialize_replacement(&mut self) {}

    /// Chooses the victim way within `set`.
    ///
    /// `blocks` is the set's way array. Returning `blocks.len()` bypasses
    /// the fill.
    fn find_victim(
        &mut self,
        cpu: usize,
        instr_id: u64,
        set: usize,
        blocks: &[Block],
        ip: u64,
        addr: u64,
        kind: AccessType,
    ) -> usize;

    /// Observes a fill (`hit == false`) or a tag-check hit (`hit == true`).
    #[allow(clippy::too_many_arguments)]
    fn update_replacement_state(
        &mut self,
        cpu: usize,
        set: usize,
        way: usize,
        addr: u64,
        ip: u64,
        victim_addr: u64,
        kind: AccessType,
        hit: bool,
    );

    /// Final statistics hook.
    fn replacement_final_stats(&mut self) {}
}

/// Builds the configured policy for a cache of `sets` x `ways`.
pub fn build(kind: ReplacementKind, sets: usize, ways: usize) -> Box<dyn Replacement> {
    match kind {
        ReplacementKind::Lru => Box::new(Lru::new(sets, ways)),
        ReplacementKind::Srrip => Box::new(Srrip::new(sets, ways)),
        ReplacementKind::Random => Box::new(Random::new(ways)),
    }
}
