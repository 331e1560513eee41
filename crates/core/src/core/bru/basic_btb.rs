//! Basic branch target buffer with a return address stack.

use crate::core::instruction::BranchType;

use super::Btb;

/// Direct-mapped target table size.
const BTB_SIZE: usize = 1024;

/// Return address stack depth.
const RAS_SIZE: usize = 64;

/// Call instruction sizes tracked for return-target computation.
const CALL_SIZE_TABLE: usize = 1024;

#[derive(Clone, Copy, Default)]
struct BtbEntry {
    tag: u64,
    target: u64,
    is_call: bool,
    is_return: bool,
    valid: bool,
}

/// Direct-mapped targets, plus a return address stack: calls push their
/// site, returns pop it and add the learned call instruction size.
pub struct BasicBtb {
    table: Vec<BtbEntry>,
    ras: Vec<u64>,
    /// Per-call-site instruction size, learned from observed return targets.
    call_size: Vec<u64>,
    /// Call site popped by the most recent return prediction.
    last_popped: Option<u64>,
}

impl Default for BasicBtb {
    fn default() -> Self {
        Self {
            table: vec![BtbEntry::default(); BTB_SIZE],
            ras: Vec::with_capacity(RAS_SIZE),
            call_size: vec![4; CALL_SIZE_TABLE],
            last_popped: None,
        }
    }
}

impl BasicBtb {
    fn index(ip: u64) -> usize {
        ((ip >> 2) as usize) & (BTB_SIZE - 1)
    }

    fn size_index(ip: u64) -> usize {
        ((ip >> 2) as usize) & (CALL_SIZE_TABLE - 1)
    }
}

impl Btb for BasicBtb {
    fn btb_prediction(&mut self, ip: u64) -> (u64, bool) {
        let entry = self.table[Self::index(ip)];
        if !entry.valid || entry.tag != ip {
            return (0, false);
        }

        if entry.is_return {
            // Return target comes from the stack, not the table.
            let Some(call_ip) = self.ras.pop() else { return (0, false) };
            self.last_popped = Some(call_ip);
            return (call_ip + self.call_size[Self::size_index(call_ip)], true);
        }

        if entry.is_call {
            if self.ras.len() == RAS_SIZE {
                self.ras.remove(0);
            }
            self.ras.push(ip);
        }
        (entry.target, true)
    }

    fn update_btb(&mut self, ip: u64, target: u64, taken: bool, branch_type: BranchType) {
        let is_call = matches!(branch_type, BranchType::DirectCall | BranchType::IndirectCall);
        let is_return = branch_type == BranchType::Return;

        if is_return {
            // Learn the call size: actual target minus the call site popped
            // when this return was predicted.
            if let Some(call_ip) = self.last_popped.take() {
                if target > call_ip && target - call_ip < 16 {
                    self.call_size[Self::size_index(call_ip)] = target - call_ip;
                }
            }
        }

        if target == 0 && !taken {
            return;
        }
        self.table[Self::index(ip)] = BtbEntry {
            tag: ip,
            target,
            is_call,
            is_return,
            valid: true,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_then_learned_target() {
        let mut btb = BasicBtb::default();
        assert_eq!(btb.btb_prediction(0x1000), (0, false));
        btb.update_btb(0x1000, 0x2000, true, BranchType::DirectJump);
        assert_eq!(btb.btb_prediction(0x1000), (0x2000, true));
    }

    #[test]
    fn test_call_then_return_uses_stack() {
        let mut btb = BasicBtb::default();
        // Teach both the call and the return.
        btb.update_btb(0x1000, 0x9000, true, BranchType::DirectCall);
        btb.update_btb(0x9100, 0x1005, true, BranchType::Return);

        // Predict the call (pushes the site), then the return.
        let (target, hit) = btb.btb_prediction(0x1000);
        assert!(hit);
        assert_eq!(target, 0x9000);

        let (ret_target, ret_hit) = btb.btb_prediction(0x9100);
        assert!(ret_hit);
        // Default call size until the size is learned.
        assert_eq!(ret_target, 0x1004);

        // The resolved return teaches the true call size.
        btb.update_btb(0x9100, 0x1005, true, BranchType::Return);
        btb.btb_prediction(0x1000);
        let (ret_target, _) = btb.btb_prediction(0x9100);
        assert_eq!(ret_target, 0x1005);
    }
}
