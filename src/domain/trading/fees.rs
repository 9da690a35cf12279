use crate::domain::market::instrument::{Instrument, InstrumentKind};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt::Debug;

/// Commission model consulted per fill. The engine does not mandate a
/// specific schedule; it expects fees as a function of the fill.
pub trait FeeModel: Debug + Send + Sync {
    /// Fee in base currency for filling `quantity` contracts/shares at `price`.
    fn fill_fee(&self, instrument: &Instrument, quantity: i64, price: Decimal) -> Decimal;

    fn description(&self) -> String;
}

/// Per-contract options commissions with a per-leg cap, flat futures-option
/// rate, and free equity fills.
#[derive(Debug, Clone)]
pub struct PerContractFeeModel {
    pub option_per_contract: Decimal,
    pub option_leg_cap: Decimal,
    pub future_option_per_contract: Decimal,
}

impl Default for PerContractFeeModel {
    fn default() -> Self {
        Self {
            option_per_contract: dec!(0.65),
            option_leg_cap: dec!(10.00),
            future_option_per_contract: dec!(2.50),
        }
    }
}

impl FeeModel for PerContractFeeModel {
    fn fill_fee(&self, instrument: &Instrument, quantity: i64, _price: Decimal) -> Decimal {
        let contracts = Decimal::from(quantity.abs());
        match instrument.kind {
            InstrumentKind::EquityOption => {
                (contracts * self.option_per_contract).min(self.option_leg_cap)
            }
            InstrumentKind::FutureOption => contracts * self.future_option_per_contract,
            _ => Decimal::ZERO,
        }
    }

    fn description(&self) -> String {
        format!(
            "Per-contract (option {} capped {}, future option {})",
            self.option_per_contract, self.option_leg_cap, self.future_option_per_contract
        )
    }
}

/// Zero-fee model for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct NoFees;

impl FeeModel for NoFees {
    fn fill_fee(&self, _instrument: &Instrument, _quantity: i64, _price: Decimal) -> Decimal {
        Decimal::ZERO
    }

    fn description(&self) -> String {
        "No fees".to_string()
    }
}
