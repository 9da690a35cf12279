use crate::domain::market::bar_slice::BarSlice;
use crate::domain::trading::position::{LegRole, Position, StrategyKind};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use uuid::Uuid;

/// The shared, read-mostly portfolio view: cash plus every open position.
///
/// The book owns the positions. Writers are the executor (fills), the exit
/// engine (closes) and the performance tracker (realized P&L), all serialized
/// by the single-threaded bar loop.
#[derive(Debug, Default)]
pub struct PositionBook {
    pub cash: Decimal,
    positions: HashMap<Uuid, Position>,
}

impl PositionBook {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            cash: starting_cash,
            positions: HashMap::new(),
        }
    }

    pub fn insert(&mut self, position: Position) {
        self.positions.insert(position.id, position);
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Position> {
        self.positions.remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Position> {
        self.positions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Position> {
        self.positions.values_mut()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.positions.keys().copied().collect()
    }

    pub fn by_strategy(&self, strategy: StrategyKind) -> impl Iterator<Item = &Position> {
        self.positions
            .values()
            .filter(move |p| p.strategy == strategy)
    }

    /// The open LEAP call backing an IPMCC structure on `underlying`, if any.
    /// Deciding between "add a weekly call" and "open the full pair" hinges
    /// on this lookup.
    pub fn active_leap_call(&self, underlying: &str) -> Option<&Position> {
        self.positions.values().find(|p| {
            p.strategy == StrategyKind::Ipmcc
                && p.underlying == underlying
                && p.has_role(LegRole::LeapCall)
        })
    }

    /// Mark every position from the bar.
    pub fn mark_all(&mut self, slice: &BarSlice) {
        for position in self.positions.values_mut() {
            position.mark_from_slice(slice);
        }
    }

    /// Cash plus the liquidation value of every open position.
    pub fn net_liq(&self) -> Decimal {
        self.cash
            + self
                .positions
                .values()
                .map(Position::liquidation_value)
                .sum::<Decimal>()
    }

    pub fn margin_used(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| p.margin_requirement)
            .sum()
    }

    /// Fraction of net liquidation consumed by margin.
    pub fn margin_utilization(&self) -> f64 {
        let net = self.net_liq();
        if net <= Decimal::ZERO {
            return 1.0;
        }
        (self.margin_used() / net).to_f64().unwrap_or(1.0)
    }

    /// Utilization if a position with `extra_margin` were added.
    pub fn margin_utilization_with(&self, extra_margin: Decimal) -> f64 {
        let net = self.net_liq();
        if net <= Decimal::ZERO {
            return 1.0;
        }
        ((self.margin_used() + extra_margin) / net)
            .to_f64()
            .unwrap_or(1.0)
    }

    /// The losing position with the worst unrealized P&L among `ids`.
    pub fn weakest_of(&self, ids: &[Uuid]) -> Option<Uuid> {
        ids.iter()
            .filter_map(|id| self.positions.get(id).map(|p| (*id, p.unrealized_pnl())))
            .min_by_key(|(_, pnl)| *pnl)
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::instrument::{Instrument, OptionRight};
    use crate::domain::risk::correlation::CorrelationGroup;
    use crate::domain::trading::lifecycle::StrategyMachine;
    use crate::domain::trading::position::FilledLeg;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn position(strategy: StrategyKind, underlying: &str, pnl_mark: Decimal) -> Position {
        let expiry = NaiveDate::from_ymd_opt(2026, 12, 18).unwrap();
        let role = if strategy == StrategyKind::Ipmcc {
            LegRole::LeapCall
        } else {
            LegRole::ShortPut
        };
        let quantity = if strategy == StrategyKind::Ipmcc { 1 } else { -1 };
        let leg = FilledLeg {
            role,
            instrument: Instrument::equity_option(underlying, expiry, dec!(450), OptionRight::Put),
            quantity,
            entry_price: dec!(2.00),
            mark: Some(pnl_mark),
        };
        let entry_cash = leg.entry_cash();
        Position {
            id: Uuid::new_v4(),
            strategy,
            underlying: underlying.to_string(),
            group: CorrelationGroup::A2,
            opened_at: Utc.with_ymd_and_hms(2026, 8, 4, 14, 30, 0).unwrap(),
            contracts: 1,
            legs: vec![leg],
            entry_cash,
            margin_requirement: dec!(5000),
            order_group_id: 1,
            machine: StrategyMachine::new("test", 1000, Duration::from_secs(1800)),
        }
    }

    #[test]
    fn net_liq_sums_cash_and_liquidation_value() {
        let mut book = PositionBook::new(dec!(60000));
        book.insert(position(StrategyKind::Lt112, "SPY", dec!(2.00)));
        // Short put marked at entry: liquidation value -200.
        assert_eq!(book.net_liq(), dec!(59800));
    }

    #[test]
    fn margin_utilization_with_proposed_entry() {
        let mut book = PositionBook::new(dec!(50000));
        book.insert(position(StrategyKind::Lt112, "SPY", dec!(2.00)));
        let with = book.margin_utilization_with(dec!(5000));
        assert!(with > book.margin_utilization());
    }

    #[test]
    fn active_leap_lookup_requires_leap_role() {
        let mut book = PositionBook::new(dec!(50000));
        book.insert(position(StrategyKind::Ipmcc, "AAPL", dec!(2.00)));
        book.insert(position(StrategyKind::Lt112, "SPY", dec!(2.00)));
        assert!(book.active_leap_call("AAPL").is_some());
        assert!(book.active_leap_call("SPY").is_none());
    }

    #[test]
    fn weakest_of_picks_worst_pnl() {
        let mut book = PositionBook::new(dec!(50000));
        let losing = position(StrategyKind::Lt112, "SPY", dec!(6.00)); // mark tripled
        let winning = position(StrategyKind::Lt112, "QQQ", dec!(1.00));
        let losing_id = losing.id;
        let ids = vec![losing.id, winning.id];
        book.insert(losing);
        book.insert(winning);
        assert_eq!(book.weakest_of(&ids), Some(losing_id));
    }
}
