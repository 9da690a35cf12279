//! First-Wednesday 120-DTE put structure (1-1-2).
//!
//! A long debit put spread plus two naked short puts further out of the
//! money. The components are managed independently after entry; the exit
//! engine closes naked puts at 90% profit and the spread at 50%.

use crate::application::strategies::{
    assess_chain, defined_risk_margin, fresh_quote, short_premium_margin, EntryPlan,
    StrategyController,
};
use crate::config::Constants;
use crate::domain::errors::ValidationError;
use crate::domain::market::bar_slice::BarSlice;
use crate::domain::market::calendar::{is_at_or_after, is_first_wednesday};
use crate::domain::market::freshness::FreshnessValidator;
use crate::domain::market::instrument::{Leg, OptionRight};
use crate::domain::trading::portfolio::PositionBook;
use crate::domain::trading::position::{LegRole, StrategyKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

pub struct Lt112Controller {
    underlying: String,
    constants: Arc<Constants>,
}

impl Lt112Controller {
    pub fn new(underlying: &str, constants: Arc<Constants>) -> Self {
        Self {
            underlying: underlying.to_string(),
            constants,
        }
    }
}

impl StrategyController for Lt112Controller {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lt112
    }

    fn underlying(&self) -> &str {
        &self.underlying
    }

    fn in_entry_window(&self, at: DateTime<Utc>) -> bool {
        is_first_wednesday(at) && is_at_or_after(at, 10, 0) && !is_at_or_after(at, 16, 0)
    }

    fn vix_band(&self) -> (Option<f64>, Option<f64>) {
        (Some(12.0), Some(35.0))
    }

    fn propose(
        &self,
        slice: &BarSlice,
        book: &PositionBook,
        contracts: u32,
        freshness: &mut FreshnessValidator,
    ) -> Result<Option<EntryPlan>, ValidationError> {
        // One structure per monthly cycle per underlying.
        if book
            .by_strategy(StrategyKind::Lt112)
            .any(|p| p.underlying == self.underlying)
        {
            return Ok(None);
        }

        let quote = fresh_quote(slice, &self.underlying, freshness)?;
        let spot = quote.price;

        let Some(chain) = slice.chain_near_dte(
            &self.underlying,
            self.constants.lt112_entry_dte,
            self.constants.lt112_dte_tolerance,
        ) else {
            return Err(ValidationError::NoSuitableContract {
                reason: format!(
                    "no chain near {} DTE for {}",
                    self.constants.lt112_entry_dte, self.underlying
                ),
            });
        };
        assess_chain(chain, slice, freshness)?;

        let spread_long = chain
            .nearest_strike(OptionRight::Put, spot * self.constants.lt112_spread_long)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no spread long strike".to_string(),
            })?;
        let spread_short = chain
            .nearest_strike(OptionRight::Put, spot * self.constants.lt112_spread_short)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no spread short strike".to_string(),
            })?;
        let naked_put = chain
            .nearest_strike(OptionRight::Put, spot * self.constants.lt112_naked_put)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no naked put strike".to_string(),
            })?;

        if spread_long.strike() <= spread_short.strike()
            || spread_short.strike() <= naked_put.strike()
        {
            return Err(ValidationError::NoSuitableContract {
                reason: "put strikes not strictly descending".to_string(),
            });
        }

        // Net per contract: two naked-put credits plus the spread short,
        // less the spread long debit. Must clear the floor as a net credit.
        let net = naked_put.mid().unwrap_or_default() * Decimal::TWO
            + spread_short.mid().unwrap_or_default()
            - spread_long.mid().unwrap_or_default();
        let floor = self.constants.min_credit_lt112;
        if net < floor {
            return Err(ValidationError::CreditBelowFloor { credit: net, floor });
        }

        let multiplier = naked_put.instrument.multiplier;
        let width = spread_long.strike() - spread_short.strike();
        let margin = short_premium_margin(spot, multiplier, contracts * 2)
            + defined_risk_margin(width, multiplier, contracts);

        debug!(
            underlying = %self.underlying,
            %spot, expiry = %chain.expiry, net = %net,
            "proposing 1-1-2 put structure"
        );

        Ok(Some(EntryPlan {
            underlying: self.underlying.clone(),
            legs: vec![
                Leg::long(spread_long.instrument.clone(), contracts),
                Leg::short(spread_short.instrument.clone(), contracts),
                Leg::short(naked_put.instrument.clone(), contracts * 2),
            ],
            roles: vec![
                LegRole::SpreadLong,
                LegRole::SpreadShort,
                LegRole::NakedPut,
            ],
            contracts,
            net_per_contract: net,
            margin_estimate: margin,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::bar_slice::QuoteSnapshot;
    use crate::domain::market::instrument::Instrument;
    use crate::domain::market::option_chain::{OptionChain, OptionQuote};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    // First Wednesday of August 2026 is the 5th; 10:00 ET = 14:00 UTC.
    fn entry_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 14, 0, 0).unwrap()
    }

    fn put(strike: Decimal, mid: Decimal, at: DateTime<Utc>, expiry: chrono::NaiveDate) -> OptionQuote {
        OptionQuote {
            instrument: Instrument::equity_option("SPY", expiry, strike, OptionRight::Put),
            bid: mid - dec!(0.05),
            ask: mid + dec!(0.05),
            last: mid,
            volume: 500,
            open_interest: 2000,
            greeks: None,
            quoted_at: at,
        }
    }

    fn slice() -> BarSlice {
        let at = entry_time();
        let mut slice = BarSlice::new(at);
        slice.quotes.insert(
            "SPY".to_string(),
            QuoteSnapshot {
                price: dec!(450),
                bid: dec!(449.98),
                ask: dec!(450.02),
                volume: 1_000_000,
                updated_at: at,
            },
        );
        let expiry = at.date_naive() + chrono::Duration::days(118);
        // Targets: long 441, short 427.5, naked 405.
        let contracts = vec![
            put(dec!(440), dec!(9.00), at, expiry),
            put(dec!(428), dec!(6.50), at, expiry),
            put(dec!(405), dec!(3.20), at, expiry),
            put(dec!(450), dec!(12.00), at, expiry),
            put(dec!(415), dec!(4.20), at, expiry),
        ];
        slice.chains.push(OptionChain::new("SPY", expiry, at, contracts));
        slice
    }

    fn controller() -> Lt112Controller {
        Lt112Controller::new("SPY", Arc::new(Constants::default()))
    }

    #[test]
    fn window_is_first_wednesday_at_ten() {
        let c = controller();
        assert!(c.in_entry_window(entry_time()));
        // 9:59 ET.
        assert!(!c.in_entry_window(Utc.with_ymd_and_hms(2026, 8, 5, 13, 59, 0).unwrap()));
        // Second Wednesday.
        assert!(!c.in_entry_window(Utc.with_ymd_and_hms(2026, 8, 12, 14, 0, 0).unwrap()));
    }

    #[test]
    fn builds_one_one_two_structure() {
        let c = controller();
        let slice = slice();
        let book = PositionBook::new(dec!(75000));
        let mut freshness = FreshnessValidator::new(std::time::Duration::from_secs(900));

        let plan = c
            .propose(&slice, &book, 2, &mut freshness)
            .unwrap()
            .unwrap();
        assert_eq!(plan.legs.len(), 3);
        // Spread long at 440, spread short at 428, naked puts doubled at 405.
        assert_eq!(plan.legs[0].quantity, 2);
        assert_eq!(plan.legs[0].instrument.strike, Some(dec!(440)));
        assert_eq!(plan.legs[1].quantity, -2);
        assert_eq!(plan.legs[1].instrument.strike, Some(dec!(428)));
        assert_eq!(plan.legs[2].quantity, -4);
        assert_eq!(plan.legs[2].instrument.strike, Some(dec!(405)));
        // Net: 2×3.20 + 6.50 − 9.00 = 3.90 credit per contract.
        assert_eq!(plan.net_per_contract, dec!(3.90));
    }

    #[test]
    fn thin_credit_is_denied() {
        let c = controller();
        let mut slice = slice();
        let at = slice.at;
        let expiry = at.date_naive() + chrono::Duration::days(118);
        // Make the naked puts nearly worthless.
        let contracts = vec![
            put(dec!(440), dec!(9.00), at, expiry),
            put(dec!(428), dec!(6.50), at, expiry),
            put(dec!(405), dec!(1.20), at, expiry),
        ];
        slice.chains = vec![OptionChain::new("SPY", expiry, at, contracts)];

        let book = PositionBook::new(dec!(75000));
        let mut freshness = FreshnessValidator::new(std::time::Duration::from_secs(900));
        let err = c.propose(&slice, &book, 1, &mut freshness).unwrap_err();
        assert!(matches!(err, ValidationError::CreditBelowFloor { .. }));
    }

    #[test]
    fn missing_cycle_chain_is_denied() {
        let c = controller();
        let mut slice = slice();
        slice.chains.clear();
        let book = PositionBook::new(dec!(75000));
        let mut freshness = FreshnessValidator::new(std::time::Duration::from_secs(900));
        let err = c.propose(&slice, &book, 1, &mut freshness).unwrap_err();
        assert!(matches!(err, ValidationError::NoSuitableContract { .. }));
    }
}
