//! Monthly covered-call structure on a long LEAP call.
//!
//! On the first trading day of the month: when an active LEAP already exists
//! for the underlying, only the weekly short call is added against it; a new
//! LEAP plus short call pair is opened atomically only when no LEAP is held.

use crate::application::strategies::{assess_chain, fresh_quote, EntryPlan, StrategyController};
use crate::config::Constants;
use crate::domain::errors::ValidationError;
use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::calendar::{is_at_or_after, is_first_trading_day_of_month};
use crate::domain::market::freshness::FreshnessValidator;
use crate::domain::market::instrument::{Leg, OptionRight};
use crate::domain::market::option_chain::{OptionChain, OptionQuote};
use crate::domain::trading::portfolio::PositionBook;
use crate::domain::trading::position::{LegRole, StrategyKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

pub struct IpmccController {
    underlying: String,
    constants: Arc<Constants>,
}

impl IpmccController {
    pub fn new(underlying: &str, constants: Arc<Constants>) -> Self {
        Self {
            underlying: underlying.to_string(),
            constants,
        }
    }

    /// Short call above the current price but below the LEAP strike, from
    /// the chain nearest the short-call DTE target.
    fn find_short_call<'a>(
        &self,
        slice: &'a BarSlice,
        spot: Decimal,
        leap_strike: Decimal,
    ) -> Result<(&'a OptionChain, &'a OptionQuote), ValidationError> {
        let Some(chain) = slice.chain_near_dte(
            &self.underlying,
            self.constants.ipmcc_short_call_dte,
            self.constants.lt112_dte_tolerance,
        ) else {
            return Err(ValidationError::NoSuitableContract {
                reason: format!(
                    "no chain near {} DTE for {}",
                    self.constants.ipmcc_short_call_dte, self.underlying
                ),
            });
        };

        let call = chain
            .side(OptionRight::Call)
            .filter(|q| q.has_valid_market())
            .filter(|q| q.strike() > spot && q.strike() < leap_strike.max(spot * Decimal::TWO))
            .min_by_key(|q| (q.strike() - spot).abs())
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no short call between spot and LEAP strike".to_string(),
            })?;
        Ok((chain, call))
    }

    /// The longest-dated call near the target delta, at least a year out.
    fn find_leap<'a>(
        &self,
        slice: &'a BarSlice,
        now: DateTime<Utc>,
    ) -> Result<(&'a OptionChain, &'a OptionQuote), ValidationError> {
        let today = now.date_naive();
        let chain = slice
            .chains_for(&self.underlying)
            .filter(|c| (c.expiry - today).num_days() >= self.constants.leap_min_dte)
            .min_by_key(|c| c.expiry)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: format!("no expiry beyond {} DTE", self.constants.leap_min_dte),
            })?;
        let leap = chain
            .nearest_delta(OptionRight::Call, self.constants.leap_call_delta)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no deep call with greeks".to_string(),
            })?;
        Ok((chain, leap))
    }
}

impl StrategyController for IpmccController {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Ipmcc
    }

    fn underlying(&self) -> &str {
        &self.underlying
    }

    fn in_entry_window(&self, at: DateTime<Utc>) -> bool {
        is_first_trading_day_of_month(at) && is_at_or_after(at, 9, 45) && !is_at_or_after(at, 16, 0)
    }

    fn vix_band(&self) -> (Option<f64>, Option<f64>) {
        (None, None)
    }

    fn propose(
        &self,
        slice: &BarSlice,
        book: &PositionBook,
        contracts: u32,
        freshness: &mut FreshnessValidator,
    ) -> Result<Option<EntryPlan>, ValidationError> {
        let quote = fresh_quote(slice, &self.underlying, freshness)?;
        let spot = quote.price;

        if let Some(existing) = book.active_leap_call(&self.underlying) {
            // A live short call means the structure is complete this cycle.
            if existing.has_role(LegRole::WeeklyCall) {
                return Ok(None);
            }

            let leap_strike = existing
                .legs_with_role(&[LegRole::LeapCall])
                .next()
                .and_then(|l| l.instrument.strike)
                .unwrap_or(spot * Decimal::TWO);
            let leap_qty = existing
                .legs_with_role(&[LegRole::LeapCall])
                .next()
                .map(|l| l.quantity.unsigned_abs() as u32)
                .unwrap_or(contracts);

            let (chain, call) = self.find_short_call(slice, spot, leap_strike)?;
            assess_chain(chain, slice, freshness)?;

            info!(
                underlying = %self.underlying,
                strike = %call.strike(),
                "existing LEAP found, adding weekly call only"
            );
            return Ok(Some(EntryPlan {
                underlying: self.underlying.clone(),
                legs: vec![Leg::short(call.instrument.clone(), leap_qty)],
                roles: vec![LegRole::WeeklyCall],
                contracts: leap_qty,
                net_per_contract: call.mid().unwrap_or_default(),
                margin_estimate: Decimal::ZERO,
            }));
        }

        // No LEAP held: open the full pair atomically.
        let (leap_chain, leap) = self.find_leap(slice, slice.at)?;
        assess_chain(leap_chain, slice, freshness)?;
        let (call_chain, call) = self.find_short_call(slice, spot, leap.strike())?;
        assess_chain(call_chain, slice, freshness)?;

        let leap_cost = leap.mid().unwrap_or_default();
        let call_credit = call.mid().unwrap_or_default();
        debug!(
            underlying = %self.underlying,
            leap_strike = %leap.strike(), call_strike = %call.strike(),
            %leap_cost, %call_credit,
            "proposing new LEAP + short call pair"
        );

        Ok(Some(EntryPlan {
            underlying: self.underlying.clone(),
            legs: vec![
                Leg::long(leap.instrument.clone(), contracts),
                Leg::short(call.instrument.clone(), contracts),
            ],
            roles: vec![LegRole::LeapCall, LegRole::WeeklyCall],
            contracts,
            net_per_contract: call_credit - leap_cost,
            // The LEAP debit is the capital this structure consumes.
            margin_estimate: leap_cost * leap.instrument.multiplier * Decimal::from(contracts),
        }))
    }
}
