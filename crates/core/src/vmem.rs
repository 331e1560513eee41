//! Virtual memory model.
//!
//! Physical pages are assigned to virtual pages on demand, so the timing
//! model sees a stable, reproducible translation for every address the trace
//! touches. This module provides:
//! 1. **Page assignment:** On-demand virtual-to-physical mapping with a
//!    randomized starting point and a minor-fault penalty on first touch.
//! 2. **Page tables:** On-demand page-table pages for every level, giving
//!    the walker real PTE addresses to read.
//! 3. **Geometry:** Per-level shift amounts and PTE offsets.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{LOG2_PAGE_SIZE, PAGE_SIZE, PTE_BYTES, PageNumber, PageOffset, bitmask, lg2};
use crate::config::VmemConfig;

/// PTE slots per page-table page.
const PTE_PER_PAGE: u64 = PAGE_SIZE / PTE_BYTES;

/// The virtual memory model shared by all walkers.
pub struct VirtualMemory {
    levels: usize,
    minor_fault_penalty: u64,
    rng: StdRng,
    /// Next data page to hand out.
    next_ppage: u64,
    /// Bound of assignable physical pages.
    ppage_limit: u64,
    vpage_map: HashMap<(usize, u64), u64>,
    /// Page-table pages: (cpu, level, region) to page base.
    table_pages: HashMap<(usize, usize, u64), u64>,
    /// Next page-table page to hand out.
    next_table_page: u64,
}

impl VirtualMemory {
    /// Builds the model for a memory of `dram_size` bytes.
    pub fn new(config: &VmemConfig, dram_size: u64) -> Self {
        assert!(config.levels >= 2, "a page table needs at least two levels");
        let ppage_limit = (dram_size >> LOG2_PAGE_SIZE).max(1 << 20);
        let mut rng = StdRng::seed_from_u64(config.seed);
        // Data pages grow down from a randomized point in high memory;
        // page-table pages grow up from low memory.
        let next_ppage = ppage_limit / 2 + rng.gen_range(0..ppage_limit / 4);
        Self {
            levels: config.levels,
            minor_fault_penalty: config.minor_fault_penalty,
            rng,
            next_ppage,
            ppage_limit,
            vpage_map: HashMap::new(),
            table_pages: HashMap::new(),
            next_table_page: 1,
        }
    }

    /// Page-table depth.
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Bit position where level `level`'s index field starts.
    pub fn shamt(&self, level: usize) -> u32 {
        LOG2_PAGE_SIZE + lg2(PTE_PER_PAGE) * level as u32
    }

    /// Level `level`'s index field of `vaddr`.
    pub fn get_offset(&self, vaddr: u64, level: usize) -> u64 {
        (vaddr >> self.shamt(level)) & bitmask(lg2(PTE_PER_PAGE))
    }

    /// Base physical address of the root page table.
    pub fn cr3(&mut self, cpu: usize) -> u64 {
        let root_level = self.levels - 1;
        self.table_page(cpu, root_level, 0).0
    }

    fn table_page(&mut self, cpu: usize, level: usize, region: u64) -> (u64, u64) {
        let mut penalty = 0;
        let next = &mut self.next_table_page;
        let base = *self.table_pages.entry((cpu, level, region)).or_insert_with(|| {
            let page = *next;
            *next += 1;
            penalty = 1;
            page << LOG2_PAGE_SIZE
        });
        (base, penalty * self.minor_fault_penalty)
    }

    /// Physical address of the PTE to read at `level` for `vaddr`, plus the
    /// allocation penalty when this is the first touch of that table page.
    pub fn pte_pa(&mut self, cpu: usize, vaddr: u64, level: usize) -> (u64, u64) {
        let region = vaddr >> self.shamt(level + 1).min(63);
        let (base, penalty) = self.table_page(cpu, level, region);
        let offset = self.get_offset(vaddr, level) * PTE_BYTES;
        (base | offset, penalty)
    }

    /// Final translation of `vaddr`, plus the minor-fault penalty when this
    /// is the first touch of the page.
    pub fn va_to_pa(&mut self, cpu: usize, vaddr: u64) -> (u64, u64) {
        let vpage = vaddr >> LOG2_PAGE_SIZE;
        let mut penalty = 0;
        let ppage = match self.vpage_map.get(&(cpu, vpage)) {
            Some(&p) => p,
            None => {
                // Walk down from the randomized point, skipping pages the
                // table allocator could collide with.
                let p = self.next_ppage % self.ppage_limit;
                self.next_ppage = self.next_ppage.wrapping_add(1 + self.rng.gen_range(0..7));
                self.vpage_map.insert((cpu, vpage), p);
                penalty = self.minor_fault_penalty;
                p
            }
        };
        (PageNumber(ppage).splice(PageOffset::from_addr(vaddr)), penalty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmemConfig;

    fn vmem() -> VirtualMemory {
        VirtualMemory::new(&VmemConfig::default(), 1 << 32)
    }

    #[test]
    fn test_translation_is_stable() {
        let mut vm = vmem();
        let (pa1, penalty1) = vm.va_to_pa(0, 0xdead_beef);
        let (pa2, penalty2) = vm.va_to_pa(0, 0xdead_beef);
        assert_eq!(pa1, pa2);
        assert!(penalty1 > 0);
        assert_eq!(penalty2, 0);
    }

    #[test]
    fn test_same_page_same_frame() {
        let mut vm = vmem();
        let (pa1, _) = vm.va_to_pa(0, 0x1000);
        let (pa2, _) = vm.va_to_pa(0, 0x1fff);
        assert_eq!(pa1 >> LOG2_PAGE_SIZE, pa2 >> LOG2_PAGE_SIZE);
        assert_eq!(pa1 & 0xfff, 0);
        assert_eq!(pa2 & 0xfff, 0xfff);
    }

    #[test]
    fn test_pte_addresses_distinct_by_level() {
        let mut vm = vmem();
        let (a, _) = vm.pte_pa(0, 0x7fff_dead_b000, 0);
        let (b, _) = vm.pte_pa(0, 0x7fff_dead_b000, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_shamt_steps_by_index_bits() {
        let vm = vmem();
        assert_eq!(vm.shamt(0), 12);
        assert_eq!(vm.shamt(1), 21);
        assert_eq!(vm.shamt(2), 30);
    }
}
