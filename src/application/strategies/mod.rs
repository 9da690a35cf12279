//! Per-strategy entry controllers.
//!
//! Each controller is a stateless decision function: given the bar, decide
//! whether its schedule window is open, build the leg structure, and price
//! it. Lifecycle management happens in the engine; risk approval always goes
//! through the unified risk manager first.

use crate::domain::errors::ValidationError;
use crate::domain::market::bar_slice::{BarSlice, QuoteSnapshot};
use crate::domain::market::freshness::{DatumKind, FreshnessValidator};
use crate::domain::market::option_chain::OptionChain;
use crate::domain::market::instrument::Leg;
use crate::domain::trading::portfolio::PositionBook;
use crate::domain::trading::position::{LegRole, StrategyKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Entry structure controllers
pub mod futures_strangle;
pub mod ipmcc;
pub mod leap_ladder;
pub mod lt112;
pub mod zero_dte;

pub use futures_strangle::FuturesStrangleController;
pub use ipmcc::IpmccController;
pub use leap_ladder::LeapLadderController;
pub use lt112::Lt112Controller;
pub use zero_dte::ZeroDteController;

/// A fully specified entry: legs with roles, sized, priced and margined.
#[derive(Debug, Clone)]
pub struct EntryPlan {
    pub underlying: String,
    pub legs: Vec<Leg>,
    /// Parallel to `legs`.
    pub roles: Vec<LegRole>,
    pub contracts: u32,
    /// Estimated net cash flow per contract: positive = credit.
    pub net_per_contract: Decimal,
    pub margin_estimate: Decimal,
}

pub trait StrategyController: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn underlying(&self) -> &str;

    /// Whether the schedule window is open at `at` (ET wall clock).
    fn in_entry_window(&self, at: DateTime<Utc>) -> bool;

    /// Required VIX band, inclusive on both ends.
    fn vix_band(&self) -> (Option<f64>, Option<f64>);

    /// Build the entry for `contracts` contracts. `Ok(None)` means nothing to
    /// do this bar (already positioned, structure complete). Stale or missing
    /// data is a hard deny, not a default.
    fn propose(
        &self,
        slice: &BarSlice,
        book: &PositionBook,
        contracts: u32,
        freshness: &mut FreshnessValidator,
    ) -> Result<Option<EntryPlan>, ValidationError>;
}

/// Fresh underlying quote or a fail-fast deny.
pub(crate) fn fresh_quote<'a>(
    slice: &'a BarSlice,
    underlying: &str,
    freshness: &mut FreshnessValidator,
) -> Result<&'a QuoteSnapshot, ValidationError> {
    let Some(quote) = slice.quote(underlying) else {
        return Err(freshness.note_missing(underlying, DatumKind::UnderlyingPrice));
    };
    freshness.assess(
        underlying,
        DatumKind::UnderlyingPrice,
        quote.updated_at,
        slice.at,
    )?;
    Ok(quote)
}

/// Chain freshness or a fail-fast deny.
pub(crate) fn assess_chain(
    chain: &OptionChain,
    slice: &BarSlice,
    freshness: &mut FreshnessValidator,
) -> Result<(), ValidationError> {
    freshness.assess(
        &chain.underlying,
        DatumKind::OptionChain,
        chain.snapshot_at,
        slice.at,
    )
}

/// Rough initial margin for short premium: 20% of underlying notional per
/// short contract.
pub(crate) fn short_premium_margin(
    underlying_price: Decimal,
    multiplier: Decimal,
    contracts: u32,
) -> Decimal {
    underlying_price * multiplier * Decimal::from(contracts) * dec!(0.20)
}

/// Margin for a defined-risk spread: the width times the multiplier.
pub(crate) fn defined_risk_margin(
    width: Decimal,
    multiplier: Decimal,
    contracts: u32,
) -> Decimal {
    width * multiplier * Decimal::from(contracts)
}
