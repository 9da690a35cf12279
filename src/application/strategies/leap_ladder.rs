//! Laddered long-put portfolio hedge.
//!
//! Monday entries add one rung at a time: a long put a year or more out,
//! struck below the market. The ladder only builds in calm-enough tape and
//! its total cost is capped at a small slice of account value.

use crate::application::strategies::{assess_chain, fresh_quote, EntryPlan, StrategyController};
use crate::config::Constants;
use crate::domain::errors::ValidationError;
use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::calendar::weekday;
use crate::domain::market::freshness::FreshnessValidator;
use crate::domain::market::instrument::{Leg, OptionRight};
use crate::domain::trading::portfolio::PositionBook;
use crate::domain::trading::position::{LegRole, StrategyKind};
use chrono::{DateTime, Utc, Weekday};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::debug;

pub struct LeapLadderController {
    underlying: String,
    constants: Arc<Constants>,
}

impl LeapLadderController {
    pub fn new(underlying: &str, constants: Arc<Constants>) -> Self {
        Self {
            underlying: underlying.to_string(),
            constants,
        }
    }

    /// Cost of the existing rungs, at entry.
    fn ladder_cost(&self, book: &PositionBook) -> Decimal {
        book.by_strategy(StrategyKind::LeapLadder)
            .filter(|p| p.underlying == self.underlying)
            .filter_map(|p| p.entry_debit())
            .sum()
    }
}

impl StrategyController for LeapLadderController {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LeapLadder
    }

    fn underlying(&self) -> &str {
        &self.underlying
    }

    fn in_entry_window(&self, at: DateTime<Utc>) -> bool {
        weekday(at) == Weekday::Mon
    }

    /// The ladder only builds below the extreme threshold; protection is
    /// bought before the fire, not during it.
    fn vix_band(&self) -> (Option<f64>, Option<f64>) {
        (None, Some(40.0))
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

        // One rung per week.
        let week_start = slice.at.date_naive()
            - chrono::Duration::days(i64::from(weekday(slice.at).num_days_from_monday()));
        if book
            .by_strategy(StrategyKind::LeapLadder)
            .any(|p| p.underlying == self.underlying && p.opened_at.date_naive() >= week_start)
        {
            return Ok(None);
        }

        let today = slice.at.date_naive();
        let chain = slice
            .chains_for(&self.underlying)
            .filter(|c| {
                let dte = (c.expiry - today).num_days();
                dte >= self.constants.leap_min_dte && dte <= self.constants.leap_max_dte
            })
            .min_by_key(|c| c.expiry)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: format!(
                    "no expiry in the {}-{} DTE band",
                    self.constants.leap_min_dte, self.constants.leap_max_dte
                ),
            })?;
        assess_chain(chain, slice, freshness)?;

        let rung = chain
            .nearest_strike(OptionRight::Put, spot * self.constants.leap_put_strike_ratio)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no protective put strike".to_string(),
            })?;

        let cost_per_contract =
            rung.mid().unwrap_or_default() * rung.instrument.multiplier;
        if cost_per_contract <= Decimal::ZERO {
            return Err(ValidationError::NoSuitableContract {
                reason: "protective put has no market".to_string(),
            });
        }

        // Cap the whole ladder at the allocation band, shrinking the rung
        // before giving up on it.
        let budget = book.net_liq() * self.constants.ladder_allocation_pct(book.net_liq());
        let spent = self.ladder_cost(book);
        let room = budget - spent;
        let affordable = (room / cost_per_contract).floor().to_u32().unwrap_or(0);
        let contracts = contracts.min(affordable);
        if contracts == 0 {
            debug!(
                underlying = %self.underlying,
                %budget, %spent, "ladder allocation exhausted"
            );
            return Ok(None);
        }

        debug!(
            underlying = %self.underlying,
            strike = %rung.strike(), expiry = %chain.expiry, contracts,
            "proposing ladder rung"
        );

        Ok(Some(EntryPlan {
            underlying: self.underlying.clone(),
            legs: vec![Leg::long(rung.instrument.clone(), contracts)],
            roles: vec![LegRole::LadderPut],
            contracts,
            net_per_contract: -rung.mid().unwrap_or_default(),
            margin_estimate: cost_per_contract * Decimal::from(contracts),
        }))
    }
}
