//! Smart limit pricing for spread legs.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Price a leg 40% into the spread from the passive side: buyers pay
/// `bid + 0.40·(ask − bid)`, sellers take `ask − 0.40·(ask − bid)`, rounded
/// to the instrument tick. Returns `None` when the market is invalid, in
/// which case the caller falls back to a market order.
pub fn smart_limit_price(
    bid: Decimal,
    ask: Decimal,
    buying: bool,
    tick: Decimal,
) -> Option<Decimal> {
    if bid <= Decimal::ZERO || ask <= Decimal::ZERO || ask < bid {
        return None;
    }
    let spread = ask - bid;
    let raw = if buying {
        bid + spread * dec!(0.40)
    } else {
        ask - spread * dec!(0.40)
    };
    Some(round_to_tick(raw, tick))
}

/// Round to the nearest multiple of `tick` (half away from zero).
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}
