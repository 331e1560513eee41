//! Branch prediction units.
//!
//! Direction predictors and branch target buffers are pluggable modules. A
//! core composes an ordered list of each; every module in a list is queried
//! and trained on every branch, and the verdict of the *last* module wins.
//! That last-wins composition is deliberate and configuration-visible:
//! earlier modules still train, so they can serve as warm standbys, but they
//! do not vote.

pub mod basic_btb;
pub mod bimodal;
pub mod gshare;

pub use self::basic_btb::BasicBtb;
pub use self::bimodal::Bimodal;
pub use self::gshare::Gshare;

use crate::config::{BranchPredictorKind, BtbKind};
use crate::core::instruction::BranchType;

/// Operations a direction predictor must provide.
pub trait BranchPredictor: Send {
    /// One-time setup.
    fn initialize(&mut self) {}

    /// Predicts the direction of the branch at `ip`.
    fn predict_branch(&mut self, ip: u64) -> bool;

    /// Trains on the resolved outcome.
    fn last_branch_result(&mut self, ip: u64, target: u64, taken: bool, branch_type: BranchType);
}

/// Operations a branch target buffer must provide.
pub trait Btb: Send {
    /// One-time setup.
    fn initialize_btb(&mut self) {}

    /// Predicts `(target, hit)` for the branch at `ip`.
    fn btb_prediction(&mut self, ip: u64) -> (u64, bool);

    /// Trains on the resolved target.
    fn update_btb(&mut self, ip: u64, target: u64, taken: bool, branch_type: BranchType);
}

/// An ordered chain of direction predictors.
pub struct PredictorChain {
    modules: Vec<Box<dyn BranchPredictor>>,
}

impl PredictorChain {
    /// Builds the configured chain. At least one module is required.
    pub fn build(kinds: &[BranchPredictorKind]) -> Self {
        assert!(!kinds.is_empty(), "a core needs at least one branch predictor");
        let modules = kinds
            .iter()
            .map(|kind| -> Box<dyn BranchPredictor> {
                match kind {
                    BranchPredictorKind::Bimodal => Box::new(Bimodal::default()),
                    BranchPredictorKind::Gshare => Box::new(Gshare::default()),
                }
            })
            .collect();
        Self { modules }
    }

    pub fn initialize(&mut self) {
        for module in &mut self.modules {
            module.initialize();
        }
    }

    /// Queries every module in order; the last verdict wins.
    pub fn predict_branch(&mut self, ip: u64) -> bool {
        let mut verdict = false;
        for module in &mut self.modules {
            verdict = module.predict_branch(ip);
        }
        verdict
    }

    /// Trains every module.
    pub fn last_branch_result(&mut self, ip: u64, target: u64, taken: bool, branch_type: BranchType) {
        for module in &mut self.modules {
            module.last_branch_result(ip, target, taken, branch_type);
        }
    }
}

/// An ordered chain of branch target buffers.
pub struct BtbChain {
    modules: Vec<Box<dyn Btb>>,
}

impl BtbChain {
    /// Builds the configured chain. At least one module is required.
    pub fn build(kinds: &[BtbKind]) -> Self {
        assert!(!kinds.is_empty(), "a core needs at least one BTB");
        let modules = kinds
            .iter()
            .map(|kind| -> Box<dyn Btb> {
                match kind {
                    BtbKind::Basic => Box::new(BasicBtb::default()),
                }
            })
            .collect();
        Self { modules }
    }

    pub fn initialize(&mut self) {
        for module in &mut self.modules {
            module.initialize_btb();
        }
    }

    /// Queries every module in order; the last verdict wins.
    pub fn btb_prediction(&mut self, ip: u64) -> (u64, bool) {
        let mut verdict = (0, false);
        for module in &mut self.modules {
            verdict = module.btb_prediction(ip);
        }
        verdict
    }

    /// Trains every module.
    pub fn update_btb(&mut self, ip: u64, target: u64, taken: bool, branch_type: BranchType) {
        for module in &mut self.modules {
            module.update_btb(ip, target, taken, branch_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(bool);

    impl BranchPredictor for Fixed {
        fn predict_branch(&mut self, _ip: u64) -> bool {
            self.0
        }
        fn last_branch_result(&mut self, _ip: u64, _target: u64, _taken: bool, _bt: BranchType) {}
    }

    #[test]
    fn test_last_module_wins() {
        let mut chain = PredictorChain {
            modules: vec![Box::new(Fixed(true)), Box::new(Fixed(false))],
        };
        assert!(!chain.predict_branch(0x1000));

        let mut chain = PredictorChain {
            modules: vec![Box::new(Fixed(false)), Box::new(Fixed(true))],
        };
        assert!(chain.predict_branch(0x1000));
    }
}
