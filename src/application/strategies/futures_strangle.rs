//! Thursday 90-DTE short strangle on futures options.
//!
//! Sells a call and a put around five to seven delta. Leverage keeps the
//! contract cap tight and the Kelly override extra conservative.

use crate::application::strategies::{
    assess_chain, fresh_quote, short_premium_margin, EntryPlan, StrategyController,
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
use std::sync::Arc;
use tracing::debug;

/// Acceptable wing delta band around the target.
const WING_DELTA_MIN: f64 = 0.04;
const WING_DELTA_MAX: f64 = 0.08;

pub struct FuturesStrangleController {
    underlying: String,
    constants: Arc<Constants>,
}

impl FuturesStrangleController {
    pub fn new(underlying: &str, constants: Arc<Constants>) -> Self {
        Self {
            underlying: underlying.to_string(),
            constants,
        }
    }
}

impl StrategyController for FuturesStrangleController {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FuturesStrangle
    }

    fn underlying(&self) -> &str {
        &self.underlying
    }

    fn in_entry_window(&self, at: DateTime<Utc>) -> bool {
        weekday(at) == Weekday::Thu && is_at_or_after(at, 10, 15) && !is_at_or_after(at, 16, 0)
    }

    fn vix_band(&self) -> (Option<f64>, Option<f64>) {
        (Some(15.0), Some(40.0))
    }

    fn propose(
        &self,
        slice: &BarSlice,
        book: &PositionBook,
        contracts: u32,
        freshness: &mut FreshnessValidator,
    ) -> Result<Option<EntryPlan>, ValidationError> {
        if book
            .by_strategy(StrategyKind::FuturesStrangle)
            .any(|p| p.underlying == self.underlying)
        {
            return Ok(None);
        }

        let quote = fresh_quote(slice, &self.underlying, freshness)?;
        let spot = quote.price;

        let Some(chain) = slice.chain_near_dte(
            &self.underlying,
            self.constants.strangle_entry_dte,
            self.constants.lt112_dte_tolerance,
        ) else {
            return Err(ValidationError::NoSuitableContract {
                reason: format!(
                    "no chain near {} DTE for {}",
                    self.constants.strangle_entry_dte, self.underlying
                ),
            });
        };
        assess_chain(chain, slice, freshness)?;

        let target = self.constants.strangle_wing_delta;
        let short_call = chain
            .nearest_delta(OptionRight::Call, target)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no call wing with greeks".to_string(),
            })?;
        let short_put = chain
            .nearest_delta(OptionRight::Put, target)
            .ok_or_else(|| ValidationError::NoSuitableContract {
                reason: "no put wing with greeks".to_string(),
            })?;

        for (name, quote) in [("call", short_call), ("put", short_put)] {
            let delta = quote.greeks.map(|g| g.delta.abs()).unwrap_or(0.0);
            if !(WING_DELTA_MIN..=WING_DELTA_MAX).contains(&delta) {
                return Err(ValidationError::NoSuitableContract {
                    reason: format!("{name} wing delta {delta:.3} outside 5-7 delta band"),
                });
            }
        }

        let credit =
            short_call.mid().unwrap_or_default() + short_put.mid().unwrap_or_default();
        let floor = self.constants.min_credit_strangle;
        if credit < floor {
            return Err(ValidationError::CreditBelowFloor {
                credit,
                floor,
            });
        }

        let multiplier = short_call.instrument.multiplier;
        debug!(
            underlying = %self.underlying,
            %spot, expiry = %chain.expiry,
            call_strike = %short_call.strike(), put_strike = %short_put.strike(),
            credit = %credit,
            "proposing short strangle"
        );

        Ok(Some(EntryPlan {
            underlying: self.underlying.clone(),
            legs: vec![
                Leg::short(short_call.instrument.clone(), contracts),
                Leg::short(short_put.instrument.clone(), contracts),
            ],
            roles: vec![LegRole::ShortCall, LegRole::ShortPut],
            contracts,
            net_per_contract: credit,
            margin_estimate: short_premium_margin(spot, multiplier, contracts),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::bar_slice::QuoteSnapshot;
    use crate::domain::market::instrument::Instrument;
    use crate::domain::market::option_chain::{Greeks, OptionChain, OptionQuote};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    // Thursday 2026-08-06, 10:15 ET.
    fn entry_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 14, 15, 0).unwrap()
    }

    fn wing(
        strike: Decimal,
        right: OptionRight,
        delta: f64,
        mid: Decimal,
        at: DateTime<Utc>,
        expiry: chrono::NaiveDate,
    ) -> OptionQuote {
        OptionQuote {
            instrument: Instrument::future_option("MES", expiry, strike, right, dec!(5)),
            bid: mid - dec!(0.10),
            ask: mid + dec!(0.10),
            last: mid,
            volume: 200,
            open_interest: 900,
            greeks: Some(Greeks {
                delta,
                gamma: 0.001,
                vega: 0.5,
                theta: -0.4,
                iv: 0.21,
            }),
            quoted_at: at,
        }
    }

    fn slice() -> BarSlice {
        let at = entry_time();
        let mut slice = BarSlice::new(at);
        slice.quotes.insert(
            "MES".to_string(),
            QuoteSnapshot {
                price: dec!(5200),
                bid: dec!(5199.75),
                ask: dec!(5200.25),
                volume: 100_000,
                updated_at: at,
            },
        );
        let expiry = at.date_naive() + chrono::Duration::days(92);
        let contracts = vec![
            wing(dec!(5800), OptionRight::Call, 0.06, dec!(18.00), at, expiry),
            wing(dec!(5900), OptionRight::Call, 0.03, dec!(9.00), at, expiry),
            wing(dec!(4500), OptionRight::Put, -0.06, dec!(22.00), at, expiry),
            wing(dec!(4300), OptionRight::Put, -0.03, dec!(11.00), at, expiry),
        ];
        slice.chains.push(OptionChain::new("MES", expiry, at, contracts));
        slice
    }

    fn controller() -> FuturesStrangleController {
        FuturesStrangleController::new("MES", Arc::new(Constants::default()))
    }

    #[test]
    fn window_is_thursday_after_1015() {
        let c = controller();
        assert!(c.in_entry_window(entry_time()));
        assert!(!c.in_entry_window(Utc.with_ymd_and_hms(2026, 8, 6, 14, 0, 0).unwrap()));
        // Friday.
        assert!(!c.in_entry_window(Utc.with_ymd_and_hms(2026, 8, 7, 14, 15, 0).unwrap()));
    }

    #[test]
    fn picks_five_to_seven_delta_wings() {
        let c = controller();
        let slice = slice();
        let book = PositionBook::new(dec!(80000));
        let mut freshness = FreshnessValidator::new(std::time::Duration::from_secs(900));

        let plan = c
            .propose(&slice, &book, 2, &mut freshness)
            .unwrap()
            .unwrap();
        assert_eq!(plan.legs.len(), 2);
        assert_eq!(plan.legs[0].instrument.strike, Some(dec!(5800)));
        assert_eq!(plan.legs[1].instrument.strike, Some(dec!(4500)));
        assert_eq!(plan.net_per_contract, dec!(40.00));
        assert!(plan.legs.iter().all(|l| l.quantity == -2));
    }

    #[test]
    fn denies_when_only_far_wings_have_greeks() {
        let c = controller();
        let at = entry_time();
        let mut slice = slice();
        let expiry = at.date_naive() + chrono::Duration::days(92);
        // Only 3-delta wings available.
        let contracts = vec![
            wing(dec!(5900), OptionRight::Call, 0.03, dec!(9.00), at, expiry),
            wing(dec!(4300), OptionRight::Put, -0.03, dec!(11.00), at, expiry),
        ];
        slice.chains = vec![OptionChain::new("MES", expiry, at, contracts)];

        let book = PositionBook::new(dec!(80000));
        let mut freshness = FreshnessValidator::new(std::time::Duration::from_secs(900));
        let err = c.propose(&slice, &book, 1, &mut freshness).unwrap_err();
        assert!(matches!(err, ValidationError::NoSuitableContract { .. }));
    }
}
