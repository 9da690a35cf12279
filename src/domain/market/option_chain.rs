use crate::domain::market::instrument::{Instrument, OptionRight};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Optional greeks attached to a quote. `iv` is annualized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub iv: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionQuote {
    pub instrument: Instrument,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: u64,
    pub open_interest: u64,
    pub greeks: Option<Greeks>,
    pub quoted_at: DateTime<Utc>,
}

impl OptionQuote {
    pub fn has_valid_market(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.ask >= self.bid
    }

    pub fn mid(&self) -> Option<Decimal> {
        if self.has_valid_market() {
            Some((self.bid + self.ask) / Decimal::TWO)
        } else {
            None
        }
    }

    pub fn strike(&self) -> Decimal {
        self.instrument.strike.unwrap_or(Decimal::ZERO)
    }

    pub fn right(&self) -> Option<OptionRight> {
        self.instrument.right
    }
}

/// Snapshot of one (underlying, expiry) slice of the options board, contracts
/// ordered by strike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionChain {
    pub underlying: String,
    pub expiry: NaiveDate,
    pub snapshot_at: DateTime<Utc>,
    contracts: Vec<OptionQuote>,
}

impl OptionChain {
    pub fn new(
        underlying: &str,
        expiry: NaiveDate,
        snapshot_at: DateTime<Utc>,
        mut contracts: Vec<OptionQuote>,
    ) -> Self {
        contracts.sort_by(|a, b| a.strike().cmp(&b.strike()));
        Self {
            underlying: underlying.to_string(),
            expiry,
            snapshot_at,
            contracts,
        }
    }

    pub fn contracts(&self) -> &[OptionQuote] {
        &self.contracts
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn side(&self, right: OptionRight) -> impl Iterator<Item = &OptionQuote> {
        self.contracts
            .iter()
            .filter(move |q| q.right() == Some(right))
    }

    /// Contract of the given right closest to `target` strike, among quotes
    /// with a valid two-sided market.
    pub fn nearest_strike(&self, right: OptionRight, target: Decimal) -> Option<&OptionQuote> {
        self.side(right)
            .filter(|q| q.has_valid_market())
            .min_by_key(|q| (q.strike() - target).abs())
    }

    /// Contract of the given right whose absolute delta is closest to
    /// `target_delta`. Quotes without greeks are skipped.
    pub fn nearest_delta(&self, right: OptionRight, target_delta: f64) -> Option<&OptionQuote> {
        self.side(right)
            .filter(|q| q.has_valid_market())
            .filter_map(|q| {
                q.greeks
                    .map(|g| (q, (g.delta.abs() - target_delta).abs()))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(q, _)| q)
    }

    /// At-the-money implied volatility: the IV of the contract nearest to
    /// `spot`, preferring quotes that carry greeks.
    pub fn atm_iv(&self, spot: Decimal) -> Option<f64> {
        self.contracts
            .iter()
            .filter(|q| q.greeks.is_some() && q.has_valid_market())
            .min_by_key(|q| (q.strike() - spot).abs())
            .and_then(|q| q.greeks.map(|g| g.iv))
    }

    pub fn find(&self, key: &str) -> Option<&OptionQuote> {
        self.contracts.iter().find(|q| q.instrument.key == key)
    }

    /// Snapshot age in whole seconds at `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.snapshot_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn quote(strike: Decimal, right: OptionRight, delta: f64) -> OptionQuote {
        let expiry = NaiveDate::from_ymd_opt(2026, 9, 18).unwrap();
        OptionQuote {
            instrument: Instrument::equity_option("SPY", expiry, strike, right),
            bid: dec!(1.00),
            ask: dec!(1.10),
            last: dec!(1.05),
            volume: 100,
            open_interest: 500,
            greeks: Some(Greeks {
                delta,
                gamma: 0.01,
                vega: 0.1,
                theta: -0.05,
                iv: 0.22,
            }),
            quoted_at: Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap(),
        }
    }

    fn chain() -> OptionChain {
        let expiry = NaiveDate::from_ymd_opt(2026, 9, 18).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        OptionChain::new(
            "SPY",
            expiry,
            at,
            vec![
                quote(dec!(440), OptionRight::Put, -0.30),
                quote(dec!(430), OptionRight::Put, -0.15),
                quote(dec!(420), OptionRight::Put, -0.06),
                quote(dec!(460), OptionRight::Call, 0.30),
                quote(dec!(470), OptionRight::Call, 0.12),
            ],
        )
    }

    #[test]
    fn nearest_strike_picks_closest_valid_quote() {
        let c = chain();
        let q = c.nearest_strike(OptionRight::Put, dec!(433)).unwrap();
        assert_eq!(q.strike(), dec!(430));
    }

    #[test]
    fn nearest_delta_matches_absolute_delta() {
        let c = chain();
        let q = c.nearest_delta(OptionRight::Put, 0.06).unwrap();
        assert_eq!(q.strike(), dec!(420));
    }

    #[test]
    fn mid_requires_valid_market() {
        let mut q = quote(dec!(440), OptionRight::Put, -0.30);
        assert_eq!(q.mid(), Some(dec!(1.05)));
        q.bid = Decimal::ZERO;
        assert_eq!(q.mid(), None);
    }
}
