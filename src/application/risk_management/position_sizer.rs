//! Kelly-capped contract sizing.
//!
//! A conservative fraction of full Kelly converts account value into a base
//! contract count, which is then modulated by the volatility-regime size
//! multiplier and clamped by both a per-strategy hard cap and an
//! account-tier cap. No single knob can blow up sizing on its own.

use crate::config::Constants;
use crate::domain::trading::position::StrategyKind;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SizerInputs {
    pub strategy: StrategyKind,
    /// Win-rate estimate p.
    pub win_rate: f64,
    /// Win/loss ratio b.
    pub win_loss_ratio: f64,
    /// Kelly-factor override; defaults to the constants table value.
    pub kelly_override: Option<f64>,
    pub account_value: Decimal,
}

impl SizerInputs {
    /// Seeded estimates per strategy from historical behaviour. Futures
    /// strangles carry an extra-conservative Kelly override for leverage.
    pub fn seeded(strategy: StrategyKind, account_value: Decimal) -> Self {
        let (win_rate, win_loss_ratio, kelly_override) = match strategy {
            StrategyKind::ZeroDte => (0.70, 0.25, None),
            StrategyKind::Lt112 => (0.85, 0.50, None),
            StrategyKind::FuturesStrangle => (0.65, 0.50, Some(0.15)),
            StrategyKind::Ipmcc => (0.75, 1.00, None),
            StrategyKind::LeapLadder => (0.50, 2.00, None),
        };
        Self {
            strategy,
            win_rate,
            win_loss_ratio,
            kelly_override,
            account_value,
        }
    }
}

pub struct PositionSizer {
    constants: Arc<Constants>,
}

impl PositionSizer {
    pub fn new(constants: Arc<Constants>) -> Self {
        Self { constants }
    }

    /// Kelly fraction f = (p·b − (1−p)) / b, clamped to [0.01, 0.25].
    fn kelly_fraction(win_rate: f64, win_loss_ratio: f64) -> f64 {
        if win_loss_ratio <= 0.0 {
            return 0.01;
        }
        let f = (win_rate * win_loss_ratio - (1.0 - win_rate)) / win_loss_ratio;
        f.clamp(0.01, 0.25)
    }

    /// Final integer contract count.
    ///
    /// `vix_multiplier` comes from the regime gate, `drawdown_multiplier`
    /// from the circuit breaker (1.0 when normal). A zero multiplier means
    /// no trade.
    pub fn contracts(
        &self,
        inputs: &SizerInputs,
        vix_multiplier: f64,
        drawdown_multiplier: f64,
    ) -> u32 {
        let kelly = Self::kelly_fraction(inputs.win_rate, inputs.win_loss_ratio);
        let factor = inputs.kelly_override.unwrap_or(self.constants.kelly_factor);
        let conservative = kelly * factor;

        let units = (inputs.account_value / self.constants.contract_unit)
            .to_f64()
            .unwrap_or(0.0);
        let base = ((units * conservative).floor() as u32).max(1);

        // A hard-zero multiplier is an explicit "no trade"; otherwise the
        // count floors at one contract and the gates decide whether it opens.
        if vix_multiplier <= 0.0 || drawdown_multiplier <= 0.0 {
            debug!(strategy = %inputs.strategy, "size multiplier is zero, no trade");
            return 0;
        }
        let modulated =
            ((f64::from(base) * vix_multiplier * drawdown_multiplier).floor() as u32).max(1);

        let strategy_cap = self.constants.strategy_contract_cap(inputs.strategy);
        let tier_cap = self.constants.tier_contract_cap(inputs.account_value);
        let finalized = modulated.min(strategy_cap).min(tier_cap).max(1);

        debug!(
            strategy = %inputs.strategy,
            kelly, conservative, base, modulated, strategy_cap, tier_cap, finalized,
            "sized position"
        );
        finalized
    }
}
