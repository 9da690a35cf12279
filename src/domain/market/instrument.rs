use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    Equity,
    Index,
    EquityOption,
    Future,
    FutureOption,
    VixIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

impl fmt::Display for OptionRight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionRight::Call => write!(f, "C"),
            OptionRight::Put => write!(f, "P"),
        }
    }
}

/// A tradable symbol, identified by a stable opaque key.
///
/// Options carry underlying, expiry, strike and right; futures carry expiry;
/// everything carries a contract multiplier and a price tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub key: String,
    pub kind: InstrumentKind,
    pub underlying: Option<String>,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<Decimal>,
    pub right: Option<OptionRight>,
    pub multiplier: Decimal,
    pub tick_size: Decimal,
}

impl Instrument {
    pub fn equity(symbol: &str) -> Self {
        Self {
            key: symbol.to_string(),
            kind: InstrumentKind::Equity,
            underlying: None,
            expiry: None,
            strike: None,
            right: None,
            multiplier: Decimal::ONE,
            tick_size: dec!(0.01),
        }
    }

    pub fn vix_index() -> Self {
        Self {
            key: "VIX".to_string(),
            kind: InstrumentKind::VixIndex,
            underlying: None,
            expiry: None,
            strike: None,
            right: None,
            multiplier: Decimal::ONE,
            tick_size: dec!(0.01),
        }
    }

    pub fn equity_option(
        underlying: &str,
        expiry: NaiveDate,
        strike: Decimal,
        right: OptionRight,
    ) -> Self {
        Self {
            key: format!("{underlying} {expiry} {right} {strike}"),
            kind: InstrumentKind::EquityOption,
            underlying: Some(underlying.to_string()),
            expiry: Some(expiry),
            strike: Some(strike),
            right: Some(right),
            multiplier: dec!(100),
            tick_size: dec!(0.01),
        }
    }

    pub fn future(symbol: &str, expiry: NaiveDate, multiplier: Decimal) -> Self {
        Self {
            key: format!("{symbol} {expiry}"),
            kind: InstrumentKind::Future,
            underlying: Some(symbol.to_string()),
            expiry: Some(expiry),
            strike: None,
            right: None,
            multiplier,
            tick_size: dec!(0.25),
        }
    }

    pub fn future_option(
        underlying: &str,
        expiry: NaiveDate,
        strike: Decimal,
        right: OptionRight,
        multiplier: Decimal,
    ) -> Self {
        Self {
            key: format!("{underlying} {expiry} {right} {strike}"),
            kind: InstrumentKind::FutureOption,
            underlying: Some(underlying.to_string()),
            expiry: Some(expiry),
            strike: Some(strike),
            right: Some(right),
            multiplier,
            tick_size: dec!(0.05),
        }
    }

    pub fn is_option(&self) -> bool {
        matches!(
            self.kind,
            InstrumentKind::EquityOption | InstrumentKind::FutureOption
        )
    }

    /// Underlying symbol for options and futures, own key otherwise.
    pub fn underlying_symbol(&self) -> &str {
        self.underlying.as_deref().unwrap_or(&self.key)
    }

    /// Calendar days to expiration. `None` for non-expiring instruments.
    pub fn dte(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expiry
            .map(|expiry| (expiry - now.date_naive()).num_days())
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// A signed instrument quantity. Positive = long, negative = short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub instrument: Instrument,
    pub quantity: i64,
}

impl Leg {
    pub fn long(instrument: Instrument, quantity: u32) -> Self {
        Self {
            instrument,
            quantity: i64::from(quantity),
        }
    }

    pub fn short(instrument: Instrument, quantity: u32) -> Self {
        Self {
            instrument,
            quantity: -i64::from(quantity),
        }
    }

    pub fn is_buy(&self) -> bool {
        self.quantity > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn option_key_is_stable() {
        let expiry = NaiveDate::from_ymd_opt(2026, 9, 18).unwrap();
        let a = Instrument::equity_option("SPY", expiry, dec!(450), OptionRight::Put);
        let b = Instrument::equity_option("SPY", expiry, dec!(450), OptionRight::Put);
        assert_eq!(a.key, b.key);
        assert_eq!(a.key, "SPY 2026-09-18 P 450");
    }

    #[test]
    fn dte_counts_calendar_days() {
        let expiry = NaiveDate::from_ymd_opt(2026, 8, 22).unwrap();
        let opt = Instrument::equity_option("SPY", expiry, dec!(450), OptionRight::Call);
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        assert_eq!(opt.dte(now), Some(21));
        assert_eq!(Instrument::equity("SPY").dte(now), None);
    }

    #[test]
    fn leg_sign_conventions() {
        let spy = Instrument::equity("SPY");
        assert_eq!(Leg::long(spy.clone(), 3).quantity, 3);
        assert_eq!(Leg::short(spy, 3).quantity, -3);
    }
}
