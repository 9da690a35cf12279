use crate::domain::market::instrument::Instrument;
use crate::domain::market::option_chain::OptionChain;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// VIX reading carried in a bar, with its own source timestamp so the gate
/// can fail fast on stale values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VixSample {
    pub level: f64,
    pub updated_at: DateTime<Utc>,
}

/// One underlying's quote in a bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub price: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: u64,
    pub updated_at: DateTime<Utc>,
}

/// The per-bar slice delivered by the market clock and data feed: current
/// time, a VIX reading, per-underlying quotes and zero or more option chains.
/// The engine assumes no minimum bar rate.
#[derive(Debug, Clone, Default)]
pub struct BarSlice {
    pub at: DateTime<Utc>,
    pub vix: Option<VixSample>,
    pub quotes: HashMap<String, QuoteSnapshot>,
    pub chains: Vec<OptionChain>,
}

impl BarSlice {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            vix: None,
            quotes: HashMap::new(),
            chains: Vec::new(),
        }
    }

    pub fn quote(&self, symbol: &str) -> Option<&QuoteSnapshot> {
        self.quotes.get(symbol)
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.quotes.get(symbol).map(|q| q.price)
    }

    /// Chains for an underlying, any expiry.
    pub fn chains_for(&self, underlying: &str) -> impl Iterator<Item = &OptionChain> {
        self.chains.iter().filter(move |c| c.underlying == underlying)
    }

    /// The chain for `underlying` whose expiry is closest to `target_dte`
    /// calendar days out, within `tolerance` days.
    pub fn chain_near_dte(
        &self,
        underlying: &str,
        target_dte: i64,
        tolerance: i64,
    ) -> Option<&OptionChain> {
        let today = self.at.date_naive();
        self.chains_for(underlying)
            .filter_map(|c| {
                let dte = (c.expiry - today).num_days();
                let miss = (dte - target_dte).abs();
                (miss <= tolerance).then_some((c, miss))
            })
            .min_by_key(|(_, miss)| *miss)
            .map(|(c, _)| c)
    }

    /// Chain expiring today, for same-day structures.
    pub fn chain_today(&self, underlying: &str) -> Option<&OptionChain> {
        let today = self.at.date_naive();
        self.chains_for(underlying).find(|c| c.expiry == today)
    }

    /// Best bid/ask for any instrument in this slice: underlying quotes for
    /// linear instruments, chain quotes for options.
    pub fn bid_ask(&self, instrument: &Instrument) -> Option<(Decimal, Decimal)> {
        if instrument.is_option() {
            for chain in self.chains_for(instrument.underlying_symbol()) {
                if let Some(q) = chain.find(&instrument.key) {
                    return Some((q.bid, q.ask));
                }
            }
            None
        } else {
            self.quotes
                .get(instrument.underlying_symbol())
                .map(|q| (q.bid, q.ask))
        }
    }

    /// Mid mark for an instrument, used for position valuation.
    pub fn mark(&self, instrument: &Instrument) -> Option<Decimal> {
        let (bid, ask) = self.bid_ask(instrument)?;
        if bid > Decimal::ZERO && ask > Decimal::ZERO && ask >= bid {
            Some((bid + ask) / Decimal::TWO)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::instrument::OptionRight;
    use crate::domain::market::option_chain::OptionQuote;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;

    #[test]
    fn chain_near_dte_respects_tolerance() {
        let at = Utc.with_ymd_and_hms(2026, 8, 5, 14, 0, 0).unwrap();
        let mut slice = BarSlice::new(at);
        let mk = |days: i64| {
            OptionChain::new(
                "SPY",
                at.date_naive() + chrono::Duration::days(days),
                at,
                vec![],
            )
        };
        slice.chains = vec![mk(100), mk(118), mk(131)];

        let chain = slice.chain_near_dte("SPY", 120, 10).unwrap();
        assert_eq!(
            chain.expiry,
            at.date_naive() + chrono::Duration::days(118)
        );
        assert!(slice.chain_near_dte("SPY", 160, 10).is_none());
    }

    #[test]
    fn bid_ask_resolves_options_through_chains() {
        let at = Utc.with_ymd_and_hms(2026, 8, 5, 14, 0, 0).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2026, 12, 18).unwrap();
        let put = Instrument::equity_option("SPY", expiry, dec!(430), OptionRight::Put);
        let quote = OptionQuote {
            instrument: put.clone(),
            bid: dec!(2.00),
            ask: dec!(2.10),
            last: dec!(2.05),
            volume: 10,
            open_interest: 100,
            greeks: None,
            quoted_at: at,
        };
        let mut slice = BarSlice::new(at);
        slice.chains = vec![OptionChain::new("SPY", expiry, at, vec![quote])];

        assert_eq!(slice.bid_ask(&put), Some((dec!(2.00), dec!(2.10))));
        assert_eq!(slice.mark(&put), Some(dec!(2.05)));
    }
}
