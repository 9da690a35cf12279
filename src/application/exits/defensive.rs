//! Portfolio-level defensive actions.
//!
//! Per-position defensive rules live in the exit engine; the checks here
//! look across positions: the combined equity-exposure breach closes the
//! weakest member of the breached groups.

use crate::domain::risk::correlation::{CorrelationGroup, CorrelationLimiter};
use crate::domain::trading::portfolio::PositionBook;
use tracing::warn;
use uuid::Uuid;

/// When combined A1 + A2 exposure exceeds the cap, pick the weakest (worst
/// unrealized P&L) equity position to close.
pub fn equity_breach_victim(
    book: &PositionBook,
    limiter: &CorrelationLimiter,
) -> Option<Uuid> {
    if limiter.equity_exposure() <= 3 {
        return None;
    }
    let mut candidates = limiter.positions_in_group(CorrelationGroup::A1);
    candidates.extend(limiter.positions_in_group(CorrelationGroup::A2));
    let victim = book.weakest_of(&candidates);
    if let Some(id) = victim {
        warn!(position = %id, "equity exposure breach, closing weakest position");
    }
    victim
}
