//! Data freshness tiers and fail-fast validation.
//!
//! During trading hours a datum older than its tier is a hard deny for the
//! requesting caller, never a defaulted value. Outside trading hours cached
//! values up to 15 minutes are acceptable for reporting, but entries remain
//! forbidden. Three consecutive stale reads for the same underlying escalate
//! to a CRITICAL event and manual-mode activation.

use crate::domain::errors::ValidationError;
use crate::domain::market::calendar::is_trading_hours;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatumKind {
    UnderlyingPrice,
    BidAsk,
    OptionChain,
    Greeks,
    Iv,
    Vix,
}

impl DatumKind {
    /// Maximum acceptable age during trading hours. Age exactly at the tier
    /// is still fresh; strictly greater is stale.
    pub fn max_age(self) -> Duration {
        match self {
            DatumKind::UnderlyingPrice => Duration::from_secs(30),
            DatumKind::BidAsk => Duration::from_secs(45),
            DatumKind::OptionChain => Duration::from_secs(60),
            DatumKind::Greeks => Duration::from_secs(120),
            DatumKind::Iv => Duration::from_secs(180),
            // The VIX feeds every gate decision and ages out like an
            // underlying price.
            DatumKind::Vix => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for DatumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatumKind::UnderlyingPrice => "underlying price",
            DatumKind::BidAsk => "bid/ask",
            DatumKind::OptionChain => "option chain",
            DatumKind::Greeks => "greeks",
            DatumKind::Iv => "iv",
            DatumKind::Vix => "VIX",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct FreshnessValidator {
    off_hours_max_age: Duration,
    consecutive_stale: HashMap<String, u32>,
    escalation_threshold: u32,
}

impl FreshnessValidator {
    pub fn new(off_hours_max_age: Duration) -> Self {
        Self {
            off_hours_max_age,
            consecutive_stale: HashMap::new(),
            escalation_threshold: 3,
        }
    }

    /// Check a datum's age against its tier, tracking consecutive failures
    /// per symbol. Fresh reads reset the streak.
    pub fn assess(
        &mut self,
        symbol: &str,
        kind: DatumKind,
        sampled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let age = now.signed_duration_since(sampled_at);
        let limit = if is_trading_hours(now) {
            kind.max_age()
        } else {
            self.off_hours_max_age
        };
        let limit_secs = limit.as_secs() as i64;

        if age.num_seconds() > limit_secs {
            let strikes = self.consecutive_stale.entry(symbol.to_string()).or_insert(0);
            *strikes += 1;
            return Err(ValidationError::StaleData {
                symbol: symbol.to_string(),
                datum: kind.to_string(),
                age_secs: age.num_seconds(),
                limit_secs,
            });
        }

        self.consecutive_stale.remove(symbol);
        Ok(())
    }

    /// Record a missing datum; counts toward the same escalation streak.
    pub fn note_missing(&mut self, symbol: &str, kind: DatumKind) -> ValidationError {
        let strikes = self.consecutive_stale.entry(symbol.to_string()).or_insert(0);
        *strikes += 1;
        ValidationError::MissingData {
            symbol: symbol.to_string(),
            datum: kind.to_string(),
        }
    }

    pub fn strikes(&self, symbol: &str) -> u32 {
        self.consecutive_stale.get(symbol).copied().unwrap_or(0)
    }

    /// True when a symbol's consecutive-stale streak has reached the
    /// escalation threshold. The caller emits the CRITICAL event and
    /// activates manual mode.
    pub fn should_escalate(&self, symbol: &str) -> bool {
        self.strikes(symbol) >= self.escalation_threshold
    }

    pub fn reset(&mut self, symbol: &str) {
        self.consecutive_stale.remove(symbol);
    }
}
