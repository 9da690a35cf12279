use crate::config::Constants;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse account-size tier gating strategy availability and per-group
/// position caps. A value exactly at a boundary maps to the lower phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccountPhase {
    Phase1,
    Phase2,
    Phase3,
    Phase4,
}

impl AccountPhase {
    pub fn from_net_liq(value: Decimal, constants: &Constants) -> Self {
        if value <= constants.phase1_max {
            AccountPhase::Phase1
        } else if value <= constants.phase2_max {
            AccountPhase::Phase2
        } else if value <= constants.phase3_max {
            AccountPhase::Phase3
        } else {
            AccountPhase::Phase4
        }
    }

    pub fn number(self) -> u8 {
        match self {
            AccountPhase::Phase1 => 1,
            AccountPhase::Phase2 => 2,
            AccountPhase::Phase3 => 3,
            AccountPhase::Phase4 => 4,
        }
    }
}

impl fmt::Display for AccountPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {}", self.number())
    }
}
