use serde::{Deserialize, Serialize};

use crate::constants::{PLATFORM_FEE_PERCENT, PLATFORM_FLAT_FEE};

/// Commission schedule applied to every sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub percent: i64,
    pub flat: i64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            percent: PLATFORM_FEE_PERCENT,
            flat: PLATFORM_FLAT_FEE,
        }
    }
}

/// Split of a gross amount between the platform and the seller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    pub amount: i64,
    pub platform_fee: i64,
    pub net_amount: i64,
}

impl FeeSchedule {
    /// `fee = round_half_up(amount * percent / 100) + flat`, `net = amount - fee`.
    ///
    /// Integer arithmetic only, so `net + fee == amount` holds exactly.
    pub fn compute(&self, amount: i64) -> FeeBreakdown {
        let percent_part = (amount * self.percent + 50).div_euclid(100);
        let platform_fee = percent_part + self.flat;
        FeeBreakdown {
            amount,
            platform_fee,
            net_amount: amount - platform_fee,
        }
    }
}
