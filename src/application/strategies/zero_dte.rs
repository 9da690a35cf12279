//! Friday same-day iron condor.
//!
//! Enters after 10:30 ET on Fridays when the regime allows it, selling the
//! strikes one expected daily move out and buying wings two moves out. The
//! expected move comes from the at-the-money annual IV scaled by the daily
//! move factor.

use crate::application::strategies::{
    assess_chain, defined_risk_margin, fresh_quote, EntryPlan, StrategyController,
};
use crate::config::Constants;
use crate::domain::errors::ValidationError;
use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::calendar::{is_at_or_after, weekday};
use crate::domain::market::freshness::FreshnessValidator;
use crate::domain::market::instrument::{Leg, OptionRight};
use crate::domain::trading::portfolio::PositionBook;
use crate::domain::trading::position::{LegRole, StrategyKind};
use chrono::{DateTime, Utc, Weekday};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_IV: f64 = 0.20;

pub struct ZeroDteController {
    underlying: String,
    constants: Arc<Constants>,
}

impl ZeroDteController {
    pub fn new(underlying: &str, constants: Arc<Constants>) -> Self {
        Self {
            underlying: underlying.to_string(),
            constants,
        }
    }

    /// Expected one-day move: price × annual IV × the daily move factor.
    fn expected_move(&self, spot: Decimal, annual_iv: f64) -> Decimal {
        let factor = Decimal::from_f64_retain(annual_iv * self.constants.iv_daily_move_factor)
            .unwrap_or(Decimal::ZERO);
        spot * factor
    }
}

impl StrategyController for ZeroDteController {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ZeroDte
    }

    fn underlying(&self) -> &str {
        &self.underlying
    }

    fn in_entry_window(&self, at: DateTime<Utc>) -> bool {
        weekday(at) == Weekday::Fri
            && is_at_or_after(at, 10, 30)
            && !is_at_or_after(at, 15, 0)
    }

    fn vix_band(&self) -> (Option<f64>, Option<f64>) {
        (Some(22.0), None)
    }

    fn propose(
        &self,
        slice: &BarSlice,
        book: &PositionBook,
        contracts: u32,
        freshness: &mut FreshnessValidator,
    ) -> Result<Option<EntryPlan>, ValidationError> {
        // One condor per Friday.
        if book
            .by_strategy(StrategyKind::ZeroDte)
            .any(|p| p.underlying == self.underlying)
        {
            return Ok(None);
        }

        let quote = fresh_quote(slice, &self.underlying, freshness)?;
        let spot = quote.price;

        let Some(chain) = slice.chain_today(&self.underlying) else {
            return Err(ValidationError::NoSuitableContract {
                reason: format!("no same-day chain for {}", self.underlying),
            });
        };
        assess_chain(chain, slice, freshness)?;

        let iv = chain.atm_iv(spot).unwrap_or(DEFAULT_IV);
        let expected = self.expected_move(spot, iv);
        if expected <= Decimal::ZERO {
            return Err(ValidationError::NoSuitableContract {
                reason: "non-positive expected move".to_string(),
            });
        }
        let wing = Decimal::from_f64_retain(self.constants.condor_wing_multiplier)
            .unwrap_or(Decimal::TWO);

        let short_call = chain
            .nearest_strike(OptionRight::Call, spot + expected)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no short call strike".to_string(),
            })?;
        let long_call = chain
            .nearest_strike(OptionRight::Call, spot + expected * wing)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no long call wing".to_string(),
            })?;
        let short_put = chain
            .nearest_strike(OptionRight::Put, spot - expected)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no short put strike".to_string(),
            })?;
        let long_put = chain
            .nearest_strike(OptionRight::Put, spot - expected * wing)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no long put wing".to_string(),
            })?;

        if long_call.strike() <= short_call.strike() || long_put.strike() >= short_put.strike() {
            return Err(ValidationError::NoSuitableContract {
                reason: "wings collapsed onto short strikes".to_string(),
            });
        }

        let credit = short_call.mid().unwrap_or_default()
            + short_put.mid().unwrap_or_default()
            - long_call.mid().unwrap_or_default()
            - long_put.mid().unwrap_or_default();
        let floor = self.constants.min_credit_condor;
        if credit < floor {
            return Err(ValidationError::CreditBelowFloor {
                credit,
                floor,
            });
        }

        let call_width = long_call.strike() - short_call.strike();
        let put_width = short_put.strike() - long_put.strike();
        let width = call_width.max(put_width);
        let multiplier = short_call.instrument.multiplier;

        debug!(
            underlying = %self.underlying,
            %spot, iv, %expected, credit = %credit,
            "proposing iron condor"
        );

        Ok(Some(EntryPlan {
            underlying: self.underlying.clone(),
            legs: vec![
                Leg::short(short_call.instrument.clone(), contracts),
                Leg::long(long_call.instrument.clone(), contracts),
                Leg::short(short_put.instrument.clone(), contracts),
                Leg::long(long_put.instrument.clone(), contracts),
            ],
            roles: vec![
                LegRole::ShortCall,
                LegRole::LongCall,
                LegRole::ShortPut,
                LegRole::LongPut,
            ],
            contracts,
            net_per_contract: credit,
            margin_estimate: defined_risk_margin(width, multiplier, contracts),
        }))
    }
}
